use crate::error::PmrsError;
use crate::registry::Outbound;
use crate::relay::Session;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Serialize `frame` and write it as one text message.
async fn send_json<T, F>(ws_tx: &mut T, frame: &F) -> Result<(), PmrsError>
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
    F: Serialize,
{
    let text = serde_json::to_string(frame)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

/// Write queued work for this connection.
///
/// A forward is acknowledged to its sender only once written; if the write
/// fails the sender gets a bounce and the connection ends.
async fn deliver_outbound<T>(ws_tx: &mut T, out: Outbound) -> Result<(), PmrsError>
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match out {
        Outbound::Reply(reply) => send_json(ws_tx, &reply).await,
        Outbound::Forward(fwd) => match send_json(ws_tx, &fwd.frame).await {
            Ok(()) => {
                fwd.acknowledge();
                Ok(())
            }
            Err(e) => {
                fwd.bounce();
                Err(e)
            }
        },
    }
}

/// Feed one inbound frame to the relay and write any immediate reply.
async fn process_frame<T>(
    data: &[u8],
    state: &ServerState,
    ws_tx: &mut T,
    session: &mut Session,
) -> Result<(), PmrsError>
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match state.relay.handle_frame(session, data) {
        Some(reply) => send_json(ws_tx, &reply).await,
        None => Ok(()),
    }
}

/// Drive the select loop for one connection until it closes.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    queue: &mut mpsc::Receiver<Outbound>,
    session: &mut Session,
    state: &ServerState,
    shutdown: &mut watch::Receiver<()>,
) -> Result<(), PmrsError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.tick().await;
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        process_frame(text.as_bytes(), state, ws_tx, session).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        process_frame(&data, state, ws_tx, session).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(PmrsError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(out) = queue.recv() => {
                last_activity = Instant::now();
                deliver_outbound(ws_tx, out).await?;
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::debug!(conn_id = session.id(), "idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
            _ = shutdown.changed() => {
                let close = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close))).await;
                return Ok(());
            }
        }
    }
}

/// Serve one accepted TCP connection: WebSocket handshake, session loop,
/// teardown.
///
/// # Errors
///
/// Returns an error if the handshake fails or the transport breaks. Either
/// way the session has been torn down and its name released.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), PmrsError> {
    let max_frame = state.config.max_frame_bytes();
    let ws_config = WebSocketConfig {
        max_message_size: Some(max_frame),
        max_frame_size: Some(max_frame),
        ..WebSocketConfig::default()
    };

    let handshake = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config));
    let ws_stream = timeout(Duration::from_secs(state.config.idle_timeout), handshake)
        .await
        .map_err(|_| PmrsError::HandshakeTimeout)??;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (mut session, mut queue) = state.relay.open_session();
    tracing::info!(conn_id = session.id(), peer = %peer_addr, "new client connected");

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut queue,
        &mut session,
        &state,
        &mut shutdown,
    )
    .await;

    state.relay.close_session(&mut session, &mut queue);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::Forward;
    use futures_util::sink;
    use pmr_common::types::{self, reason};
    use pmr_common::{Forwarded, Reply, ServerFrame};

    fn collecting_sink() -> (
        impl Sink<Message, Error = tungstenite::Error> + Unpin,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::pin(sink::unfold(tx, |tx, msg: Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        }));
        (sink, rx)
    }

    fn failing_sink() -> impl Sink<Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold((), |(), _msg: Message| async move {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }))
    }

    fn text(msg: Message) -> ServerFrame {
        match msg {
            Message::Text(text) => ServerFrame::parse(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn forward(reply_to: mpsc::Sender<Outbound>) -> Forward {
        Forward {
            frame: Forwarded {
                from: "alice".into(),
                message: "hi".into(),
                timestamp: types::now(),
            },
            to: "bob".into(),
            reply: reply_to.try_reserve_owned().unwrap(),
        }
    }

    #[tokio::test]
    async fn written_forward_is_acknowledged() {
        let (mut sink, mut written) = collecting_sink();
        let (reply_to, mut sender_rx) = mpsc::channel(4);

        deliver_outbound(&mut sink, Outbound::Forward(forward(reply_to)))
            .await
            .unwrap();

        match text(written.recv().await.unwrap()) {
            ServerFrame::Forwarded(fwd) => {
                assert_eq!(fwd.from, "alice");
                assert_eq!(fwd.message, "hi");
            }
            other => panic!("expected forwarded payload, got {other:?}"),
        }
        assert!(matches!(
            sender_rx.recv().await,
            Some(Outbound::Reply(Reply::Delivered { .. }))
        ));
    }

    #[tokio::test]
    async fn failed_forward_write_bounces_to_sender() {
        let mut sink = failing_sink();
        let (reply_to, mut sender_rx) = mpsc::channel(4);

        let result = deliver_outbound(&mut sink, Outbound::Forward(forward(reply_to))).await;
        assert!(result.is_err());

        match sender_rx.recv().await {
            Some(Outbound::Reply(reply)) => {
                assert_eq!(reply, Reply::error(reason::RECIPIENT_OFFLINE));
            }
            other => panic!("expected bounce, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_reply_is_written_as_is() {
        let (mut sink, mut written) = collecting_sink();

        deliver_outbound(&mut sink, Outbound::Reply(Reply::error(reason::RECIPIENT_BUSY)))
            .await
            .unwrap();

        assert_eq!(
            text(written.recv().await.unwrap()),
            ServerFrame::Reply(Reply::error(reason::RECIPIENT_BUSY))
        );
    }

    #[tokio::test]
    async fn process_frame_writes_relay_reply() {
        let state = ServerState::new(ServerConfig::default());
        let (mut session, _queue) = state.relay.open_session();
        let (mut sink, mut written) = collecting_sink();

        process_frame(b"not json", &state, &mut sink, &mut session)
            .await
            .unwrap();
        assert_eq!(
            text(written.recv().await.unwrap()),
            ServerFrame::Reply(Reply::error(reason::INVALID_FORMAT))
        );

        process_frame(br#"{"ignored":true}"#, &state, &mut sink, &mut session)
            .await
            .unwrap();
        assert!(written.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let state = Arc::new(ServerState::new(ServerConfig {
            idle_timeout: 1,
            ..ServerConfig::default()
        }));
        let (_close_tx, close_rx) = watch::channel(());

        let result = handle_connection(stream, peer, Arc::clone(&state), close_rx).await;
        assert!(matches!(result, Err(PmrsError::HandshakeTimeout)));
        assert!(state.relay.registry().is_empty());
    }
}
