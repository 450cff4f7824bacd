//! Connection Controller
//!
//! Owns the single logical connection: the current [`ConnectionState`], the
//! transport handle and a generation counter that identifies which opened
//! connection is the live one. Events from handles of an older generation are
//! ignored, so a connection torn down by `disconnect()` can never move the
//! state machine again.
//!
//! # State Machine
//!
//! ```text
//!                connect()            transport: connect
//! Disconnected ───────────► Connecting ─────────────────► Connected
//!      ▲                                                     │
//!      │  transport: close (from Connected/Error)            │
//!      └──────────────────────────────── Error ◄─────────────┘
//!                                          transport: error (any state)
//!
//! any ──reconnecting──► Reconnecting     any ──offline──► Offline
//! any ──disconnect()──► Disconnected (handle closed, generation bumped)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{TransportEvent, TransportHandle};

/// Connection health as reported by the transport.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
    Error,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Result of applying one transport event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn entered_connected(&self) -> bool {
        self.to.is_connected()
    }

    pub fn left_connected(&self) -> bool {
        self.from.is_connected() && !self.to.is_connected()
    }
}

pub(crate) struct ConnectionController {
    state: ConnectionState,
    handle: Option<Arc<dyn TransportHandle>>,
    generation: u64,
    epoch: u64,
    attempting: bool,
    last_error: Option<TransportError>,
}

impl ConnectionController {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handle: None,
            generation: 0,
            epoch: 0,
            attempting: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Counts every entry into `Connected`, so work issued on one broker
    /// connection can be told apart from work issued on the next.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_idle(&self) -> bool {
        !self.attempting && self.handle.is_none() && self.state == ConnectionState::Disconnected
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && (self.attempting || self.handle.is_some())
    }

    pub fn handle(&self) -> Option<Arc<dyn TransportHandle>> {
        self.handle.clone()
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// Starts a new connection attempt unless one is already in flight or a
    /// handle is live. The attempt belongs to the new [`Self::generation`].
    pub fn begin_connect(&mut self) -> Option<Transition> {
        if self.attempting || self.handle.is_some() {
            debug!("connect() ignored, connection already active ({})", self.state);
            return None;
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("connect() ignored, state is {}", self.state);
            return None;
        }

        self.generation += 1;
        self.attempting = true;
        Some(self.set(ConnectionState::Connecting))
    }

    /// Stores the handle returned by a successful `open`.
    pub fn attach(&mut self, generation: u64, handle: Arc<dyn TransportHandle>) -> bool {
        if generation != self.generation || !self.attempting {
            return false;
        }
        self.attempting = false;
        self.handle = Some(handle);
        true
    }

    /// Records that `open` itself failed; no handle exists.
    pub fn open_failed(&mut self, generation: u64, error: TransportError) -> Option<Transition> {
        if generation != self.generation || !self.attempting {
            return None;
        }
        warn!("Failed to open transport: {}", error);
        self.attempting = false;
        self.last_error = Some(error);
        Some(self.set(ConnectionState::Error))
    }

    /// Applies a lifecycle event. Message events never change state.
    pub fn apply(&mut self, event: &TransportEvent) -> Transition {
        let next = match event {
            TransportEvent::Connect => {
                if !self.state.is_connected() {
                    self.epoch += 1;
                }
                self.last_error = None;
                ConnectionState::Connected
            }
            TransportEvent::Error(e) => {
                warn!("Transport reported error: {}", e);
                self.last_error = Some(e.clone());
                ConnectionState::Error
            }
            TransportEvent::Close => match self.state {
                ConnectionState::Connected | ConnectionState::Error => {
                    ConnectionState::Disconnected
                }
                other => other,
            },
            TransportEvent::Reconnecting => ConnectionState::Reconnecting,
            TransportEvent::Offline => ConnectionState::Offline,
            TransportEvent::Message { .. } => self.state,
        };
        self.set(next)
    }

    /// Drops the live handle, invalidating every event source of the current
    /// generation. The caller closes the returned handle.
    pub fn teardown(&mut self) -> (Transition, Option<Arc<dyn TransportHandle>>) {
        self.generation += 1;
        self.attempting = false;
        self.last_error = None;
        let handle = self.handle.take();
        (self.set(ConnectionState::Disconnected), handle)
    }

    fn set(&mut self, next: ConnectionState) -> Transition {
        let transition = Transition {
            from: self.state,
            to: next,
        };
        if transition.changed() {
            info!("Connection state: {} -> {}", transition.from, transition.to);
        }
        self.state = next;
        transition
    }
}
