#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use pmr_common::{ClientFrame, Forwarded, Reply, ServerFrame};
use pmrs::config::ServerConfig;
use pmrs::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        health_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect and register, asserting the registration succeeds.
    pub async fn register_as(addr: &SocketAddr, name: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.register(name).await;
        match client.recv_reply().await {
            Reply::Registered { username, .. } => assert_eq!(username, name),
            other => panic!("expected registered, got {other:?}"),
        }
        client
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn register(&mut self, name: &str) {
        self.send_text(&ClientFrame::register(name)).await;
    }

    pub async fn send_message(&mut self, to: &str, message: &str) {
        self.send_text(&ClientFrame::send(to, message)).await;
    }

    pub async fn recv_frame(&mut self) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return ServerFrame::parse(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_reply(&mut self) -> Reply {
        match self.recv_frame().await {
            ServerFrame::Reply(reply) => reply,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    pub async fn recv_forwarded(&mut self) -> Forwarded {
        match self.recv_frame().await {
            ServerFrame::Forwarded(fwd) => fwd,
            other => panic!("expected forwarded message, got {other:?}"),
        }
    }

    pub async fn recv_frame_timeout(&mut self, timeout: Duration) -> Option<ServerFrame> {
        tokio::time::timeout(timeout, self.recv_frame()).await.ok()
    }

    /// Wait for the server to close the connection, returning the close frame
    /// if one was sent.
    pub async fn recv_close(&mut self) -> Option<Message> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for close")
            {
                Some(Ok(msg @ Message::Close(_))) => return Some(msg),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        // Wait for the server to finish the close handshake.
        while let Ok(Some(Ok(_))) =
            tokio::time::timeout(Duration::from_secs(2), self.ws_rx.next()).await
        {}
    }
}

pub async fn start_server_with(config_fn: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config_fn(&mut config);
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = pmrs::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

/// Start a server that shuts down when the returned sender fires.
pub async fn start_server_with_shutdown() -> (
    SocketAddr,
    Arc<ServerState>,
    oneshot::Sender<()>,
    JoinHandle<()>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    config.drain_timeout = 5;
    let state = Arc::new(ServerState::new(config));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let state_clone = state.clone();
    let handle = tokio::spawn(async move {
        let shutdown = async {
            let _ = stop_rx.await;
        };
        if let Err(e) = pmrs::run_with_shutdown(listener, state_clone, shutdown).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state, stop_tx, handle)
}

/// Poll until `check` holds or a few seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
