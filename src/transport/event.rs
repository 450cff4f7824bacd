use std::fmt;

use crate::error::TransportError;

/// Everything a transport connection can report to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the connection
    Connect,
    /// Protocol or network failure; the connection may still recover on its own
    Error(TransportError),
    /// The connection was closed
    Close,
    /// The transport is retrying after losing the connection
    Reconnecting,
    /// No network path to the broker
    Offline,
    /// An inbound publish frame
    Message { topic: String, payload: Vec<u8> },
}

impl TransportEvent {
    pub fn message(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::Message {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportEvent::Connect => write!(f, "connect"),
            TransportEvent::Error(e) => write!(f, "error({})", e),
            TransportEvent::Close => write!(f, "close"),
            TransportEvent::Reconnecting => write!(f, "reconnecting"),
            TransportEvent::Offline => write!(f, "offline"),
            TransportEvent::Message { topic, payload } => {
                write!(f, "message({}, {} bytes)", topic, payload.len())
            }
        }
    }
}

/// Per-publish options passed through to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to keep this message as the topic's retained value
    pub retain: bool,
}

impl PublishOptions {
    pub fn retained() -> Self {
        Self { retain: true }
    }
}
