//! pmr JSON frame classification and encoding.
//!
//! Every frame is one UTF-8 JSON object carried in a single WebSocket
//! message. Client frames are classified by shape rather than by a type tag:
//! a registration carries `register: true` plus a `username`, a delivery
//! carries `to` plus `message`. Anything else that parses is
//! [`ClientFrame::Unrecognized`] and is ignored by the relay.

use crate::types::{iso_millis, Username};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A classified client-to-relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Request to bind the connection to a display name.
    Register {
        /// Desired unique name.
        username: Username,
    },
    /// Request to forward a message to another registered name.
    Send {
        /// Recipient name.
        to: Username,
        /// Message body.
        message: String,
    },
    /// A well-formed object matching neither request shape.
    Unrecognized,
}

/// Errors that can occur while parsing a client frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A binary frame did not contain UTF-8 text.
    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    /// The text was not valid JSON.
    #[error("frame is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The JSON value was not an object.
    #[error("frame is not a json object")]
    NotAnObject,
}

impl ClientFrame {
    /// Parse and classify raw frame bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the bytes are not a UTF-8 JSON object.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(data)?;
        Self::parse_str(text)
    }

    /// Parse and classify a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the text is not a JSON object.
    pub fn parse_str(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(obj) = value else {
            return Err(FrameError::NotAnObject);
        };
        Ok(Self::classify(&obj))
    }

    fn classify(obj: &Map<String, Value>) -> Self {
        if obj.get("register") == Some(&Value::Bool(true)) {
            if let Some(username) = non_empty_str(obj, "username") {
                return Self::Register {
                    username: username.to_owned(),
                };
            }
        }
        match (non_empty_str(obj, "to"), non_empty_str(obj, "message")) {
            (Some(to), Some(message)) => Self::Send {
                to: to.to_owned(),
                message: message.to_owned(),
            },
            _ => Self::Unrecognized,
        }
    }

    /// Short label for logging and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Send { .. } => "send",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Encode a registration request.
    #[must_use]
    pub fn register(username: &str) -> String {
        serde_json::json!({ "register": true, "username": username }).to_string()
    }

    /// Encode a delivery request.
    #[must_use]
    pub fn send(to: &str, message: &str) -> String {
        serde_json::json!({ "to": to, "message": message }).to_string()
    }
}

fn non_empty_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Relay-to-client control frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    /// Registration accepted.
    Registered {
        /// Always `true`.
        success: bool,
        /// The bound name.
        username: Username,
        /// Registry size after the registration.
        #[serde(rename = "onlineCount")]
        online_count: usize,
    },
    /// A rejected operation or unparseable frame.
    Error {
        /// Human-readable reason, one of [`crate::types::reason`].
        message: String,
    },
    /// Delivery acknowledgment.
    Delivered {
        /// Recipient name.
        to: Username,
        /// Time the forward was written to the recipient.
        #[serde(with = "iso_millis")]
        timestamp: DateTime<Utc>,
    },
}

impl Reply {
    /// Build a `registered` reply.
    #[must_use]
    pub fn registered(username: impl Into<Username>, online_count: usize) -> Self {
        Self::Registered {
            success: true,
            username: username.into(),
            online_count,
        }
    }

    /// Build an `error` reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Build a `delivered` ack.
    #[must_use]
    pub fn delivered(to: impl Into<Username>, timestamp: DateTime<Utc>) -> Self {
        Self::Delivered {
            to: to.into(),
            timestamp,
        }
    }
}

/// A message forwarded to its recipient. Carries no `type` tag on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwarded {
    /// Sender's bound name.
    pub from: Username,
    /// Message body.
    pub message: String,
    /// Time the relay forwarded the message.
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Any relay-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// A control reply.
    Reply(Reply),
    /// A forwarded message.
    Forwarded(Forwarded),
}

impl ServerFrame {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text matches no server frame shape.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<Reply> for ServerFrame {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl From<Forwarded> for ServerFrame {
    fn from(fwd: Forwarded) -> Self {
        Self::Forwarded(fwd)
    }
}
