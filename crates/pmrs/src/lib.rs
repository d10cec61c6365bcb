//! pmr relay server: named point-to-point messaging over WebSocket.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Health-check and metrics HTTP endpoint.
pub mod health;
/// Prometheus metric helpers.
pub mod metrics;
/// Name registry for connected users.
pub mod registry;
/// Session lifecycle and message dispatch.
pub mod relay;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
