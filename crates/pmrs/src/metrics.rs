/// Connection and registry gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("pmr_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("pmr_connections_active").decrement(1.0);
    }

    /// Set the number of registered names.
    pub fn set_users_registered(count: usize) {
        metrics::gauge!("pmr_users_registered").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a registration attempt with the given status label.
    pub fn registrations_total(status: &'static str) {
        metrics::counter!("pmr_registrations_total", "status" => status).increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("pmr_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("pmr_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the rejected-frames counter with the given reason label.
    pub fn frames_rejected_total(reason: &'static str) {
        metrics::counter!("pmr_frames_rejected_total", "reason" => reason).increment(1);
    }
}
