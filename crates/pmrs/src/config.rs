use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};

/// What to do when an already-registered connection sends another
/// registration request.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReregisterPolicy {
    /// Reply with an `Already registered` error and keep the current name.
    #[default]
    Reject,
    /// Drop the request without a reply.
    Ignore,
    /// Claim the new name, then release the old one.
    Rebind,
}

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "pmrs")]
#[command(about = "pmr relay server")]
#[command(version)]
pub struct Args {
    /// Address to bind the WebSocket listener to.
    #[arg(long, default_value = "0.0.0.0", env = "PMRS_HOST")]
    pub host: IpAddr,
    /// Port for the WebSocket listener.
    #[arg(long, default_value = "8080", env = "PORT")]
    pub port: u16,
    /// Socket address for the health and metrics endpoint.
    #[arg(long, default_value = "0.0.0.0:8081", env = "PMRS_HEALTH")]
    pub health_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "PMRS_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum message body size in bytes.
    #[arg(long, default_value = "65536", env = "PMRS_MAX_MESSAGE_BYTES")]
    pub max_message_bytes: usize,
    /// Per-connection outbound queue capacity.
    #[arg(long, default_value = "256", env = "PMRS_QUEUE_CAPACITY")]
    pub queue_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "PMRS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "PMRS_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Seconds to wait for open connections to close on shutdown.
    #[arg(long, default_value = "10", env = "PMRS_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Handling of registration requests on an already-named connection.
    #[arg(long, value_enum, default_value_t = ReregisterPolicy::Reject, env = "PMRS_REREGISTER")]
    pub reregister: ReregisterPolicy,
    /// Emit logs as JSON lines.
    #[arg(long, env = "PMRS_JSON_LOGS")]
    pub json_logs: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the health endpoint.
    pub health_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum message body size in bytes.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue capacity.
    pub queue_capacity: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Shutdown drain timeout in seconds.
    pub drain_timeout: u64,
    /// Re-registration policy.
    pub reregister: ReregisterPolicy,
}

/// Bytes allowed for the JSON envelope around a message body.
const FRAME_OVERHEAD: usize = 4096;

/// Worst-case JSON expansion of a string (`\u0000` escapes).
const JSON_ESCAPE_FACTOR: usize = 6;

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        const MAX_ALLOWED_MESSAGE: usize = 16 * 1024 * 1024;
        if self.max_message_bytes == 0 {
            return Err("max_message_bytes must be greater than 0".to_string());
        }
        if self.max_message_bytes > MAX_ALLOWED_MESSAGE {
            return Err(format!(
                "max_message_bytes exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE
            ));
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if self.queue_capacity > 65_536 {
            return Err("queue_capacity exceeds reasonable limit (65,536)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        // Idle checks run on the ping tick.
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout must be at least ping_interval".to_string());
        }

        if self.drain_timeout > 300 {
            return Err("drain_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }

    /// Largest WebSocket message the transport accepts.
    ///
    /// Sized so any body within `max_message_bytes` fits even when fully
    /// escaped; oversized bodies below this bound get an error frame, larger
    /// frames close the connection.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_message_bytes
            .saturating_mul(JSON_ESCAPE_FACTOR)
            .saturating_add(FRAME_OVERHEAD)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_conns: 10_000,
            max_message_bytes: 65_536,
            queue_capacity: 256,
            ping_interval: 30,
            idle_timeout: 120,
            drain_timeout: 10,
            reregister: ReregisterPolicy::Reject,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: SocketAddr::new(args.host, args.port),
            health_addr: args.health_addr,
            max_conns: args.max_conns,
            max_message_bytes: args.max_message_bytes,
            queue_capacity: args.queue_capacity,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            drain_timeout: args.drain_timeout,
            reregister: args.reregister,
        }
    }
}
