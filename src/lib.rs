//! Client-side session manager for a publish/subscribe broker.
//!
//! A [`Session`] owns one logical broker connection. It tracks connection
//! health, keeps the set of desired subscriptions alive across reconnects,
//! records inbound messages in a bounded history and routes them to
//! per-topic listeners. Publish, subscribe and unsubscribe return an
//! awaitable [`Outcome`] and optionally invoke a callback with the same
//! result.
//!
//! The wire protocol lives behind the [`transport::Transport`] trait;
//! [`transport::mqtt::MqttTransport`] is the rumqttc-backed implementation.

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod transport;

pub use config::{ConnectionConfig, Settings};
pub use error::{SessionError, TransportError};
pub use session::{ConnectionState, InboundMessage, Outcome, Payload, Session, SessionEvent};
