use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::PmrsError;
use crate::metrics::gauges;
use crate::relay::Relay;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Name registry and dispatch rules.
    pub relay: Relay,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Number of connection tasks currently alive.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Build server state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            relay: Relay::new(&config),
            config,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Number of open connections, registered or not.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Counts a connection as active for as long as its task lives.
struct ActiveGuard {
    state: Arc<ServerState>,
}

impl ActiveGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Self { state }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// Run the accept loop with no external shutdown signal.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), PmrsError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Run the server accept loop until `shutdown` resolves.
///
/// On shutdown the loop stops accepting, every open connection is sent a
/// WebSocket close, and in-flight connection tasks are awaited for up to the
/// configured drain timeout.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: F,
) -> Result<(), PmrsError>
where
    F: Future<Output = ()> + Send,
{
    let local_addr = listener.local_addr().map_err(PmrsError::Io)?;
    info!("server listening on {}", local_addr);

    let (close_tx, close_rx) = watch::channel(());
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.connection_count() >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let active = ActiveGuard::new(Arc::clone(&state));
                        let state = Arc::clone(&state);
                        let close_rx = close_rx.clone();
                        tasks.spawn(async move {
                            let _active = active;
                            if let Err(e) = handle_connection(stream, addr, state, close_rx).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            () = &mut shutdown => {
                info!("shutdown signal received, closing {} connections", tasks.len());
                break;
            }
        }
    }

    drop(listener);
    let _ = close_tx.send(());

    let drain_timeout = std::time::Duration::from_secs(state.config.drain_timeout);
    let drained = tokio::time::timeout(drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    info!("server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState::new(ServerConfig::default()))
    }

    #[test]
    fn active_guard_counts_while_alive() {
        let state = state();
        {
            let _a = ActiveGuard::new(Arc::clone(&state));
            let _b = ActiveGuard::new(Arc::clone(&state));
            assert_eq!(state.connection_count(), 2);
        }
        assert_eq!(state.connection_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_future_stops_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_with_shutdown(listener, state(), async {}),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
