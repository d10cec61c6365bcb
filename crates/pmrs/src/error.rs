use thiserror::Error;

/// Errors that can occur during relay server operation.
///
/// Protocol-level rejections (bad frames, name conflicts, unknown recipients)
/// are never errors here: they are answered with `error` frames and the
/// connection stays open. These variants end a connection or the server.
#[derive(Error, Debug)]
pub enum PmrsError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A server frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// The client did not finish the WebSocket handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Why a registration could not be completed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Another connection already holds the name.
    #[error("username already in use: {0}")]
    Taken(String),
}
