//! Core type definitions and protocol constants for pmr.

use chrono::{DateTime, SecondsFormat, Utc};

/// A registered display name.
pub type Username = String;

/// Human-readable reasons carried in `error` frames from relay to client.
pub mod reason {
    /// The frame was not valid UTF-8 JSON, or not a JSON object.
    pub const INVALID_FORMAT: &str = "Invalid message format";
    /// Another connection already holds the requested name.
    pub const USERNAME_TAKEN: &str = "Username already in use";
    /// A delivery was attempted before the connection registered.
    pub const REGISTER_FIRST: &str = "Please register first";
    /// The recipient is not registered, or went away before delivery.
    pub const RECIPIENT_OFFLINE: &str = "Recipient not found or offline";
    /// The connection already holds a name and re-registration is rejected.
    pub const ALREADY_REGISTERED: &str = "Already registered";
    /// The message body exceeds the relay's size limit.
    pub const MESSAGE_TOO_LARGE: &str = "Message too large";
    /// The recipient's outbound queue is full.
    pub const RECIPIENT_BUSY: &str = "Recipient is busy";
}

/// Current wall-clock time in UTC.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as ISO-8601 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serde adapter encoding `DateTime<Utc>` as an ISO-8601 millisecond string.
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    /// Deserialize any RFC 3339 timestamp into UTC.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
