//! Error types shared by the session core and the transport adapters.

use thiserror::Error;

use crate::session::ConnectionState;

/// Whatever the underlying connection layer reported for a connect, publish,
/// subscribe or unsubscribe failure.
///
/// Stored as a rendered message so a single failure can be handed to both the
/// awaiting caller and an optional completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::new(format!("Client request rejected: {}", e))
    }
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        Self::new(format!("Connection error: {}", e))
    }
}

/// Failure branch of every publish, subscribe and unsubscribe outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The operation was attempted while the session was not connected.
    /// The transport was never contacted.
    #[error("Session not ready (state: {0})")]
    NotReady(ConnectionState),

    /// The transport accepted the request but reported a failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The operation was in flight when `disconnect()` tore the session down.
    #[error("Operation abandoned: session disconnected")]
    Disconnected,
}
