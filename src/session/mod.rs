//! # Session
//!
//! A [`Session`] maintains one logical connection to a broker and everything
//! that has to survive around it:
//!
//! ```text
//! session/
//! ├── controller.rs  - connection state machine and transport handle
//! ├── registry.rs    - desired/acknowledged topic sets and reconciliation
//! ├── dispatcher.rs  - history recording and per-topic listener fan-out
//! ├── history.rs     - bounded FIFO of inbound messages
//! ├── message.rs     - inbound message and outbound payload types
//! ├── pending.rs     - in-flight operation table
//! └── outcome.rs     - awaitable operation result
//! ```
//!
//! ## Concurrency
//!
//! All mutable session state (state machine, topic sets, history, pending
//! operations) sits behind one mutex. Transport methods, listeners and
//! completion callbacks are always invoked after that lock is released, so a
//! transport may complete a request synchronously and a listener may call
//! back into the session.
//!
//! ## Change Notification
//!
//! [`Session::watch_state`] follows the connection state;
//! [`Session::events`] additionally reports subscription and history changes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_session::config::ConnectionConfig;
//! use mqtt_session::session::Session;
//! use mqtt_session::transport::mqtt::MqttTransport;
//!
//! # async fn run() -> Result<(), mqtt_session::error::SessionError> {
//! let config = ConnectionConfig::new("mqtt://localhost:1883");
//! let session = Session::new(config, MqttTransport::new());
//! session.connect();
//!
//! let mut state = session.watch_state();
//! let _ = state.wait_for(|s| s.is_connected()).await;
//!
//! session.subscribe(["sensors/1"]).await?;
//! session.publish("sensors/1", "42").await?;
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod dispatcher;
pub mod history;
pub mod message;
pub mod outcome;
pub mod pending;
mod registry;


pub use controller::{ConnectionState, Transition};
pub use dispatcher::{Listener, ListenerError, ListenerId};
pub use history::{HistoryBuffer, HISTORY_CAPACITY};
pub use message::{InboundMessage, Payload};
pub use outcome::Outcome;
pub use pending::{Callback, OperationKind};

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{SessionError, TransportError};
use crate::transport::{
    Completion, EventSink, PublishOptions, Transport, TransportEvent, TransportHandle,
};
use controller::ConnectionController;
use dispatcher::MessageDispatcher;
use pending::{PendingOperation, PendingOperations};
use registry::SubscriptionRegistry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notifications published on [`Session::events`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    SubscriptionsChanged,
    HistoryChanged,
}

struct Core {
    controller: ConnectionController,
    registry: SubscriptionRegistry,
    dispatcher: MessageDispatcher,
    pending: PendingOperations,
}

impl Core {
    /// The live handle, but only while connected.
    fn ready_handle(&self) -> Result<Arc<dyn TransportHandle>, SessionError> {
        let state = self.controller.state();
        match self.controller.handle() {
            Some(handle) if state.is_connected() => Ok(handle),
            _ => Err(SessionError::NotReady(state)),
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Client-side session manager for one broker connection.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: ConnectionConfig, transport: impl Transport + 'static) -> Self {
        Self::with_history(config, transport, HistoryBuffer::default())
    }

    /// Creates a session with a custom history buffer.
    pub fn with_history(
        config: ConnectionConfig,
        transport: impl Transport + 'static,
        history: HistoryBuffer,
    ) -> Self {
        let core = Core {
            controller: ConnectionController::new(),
            registry: SubscriptionRegistry::new(&config.topics),
            dispatcher: MessageDispatcher::new(history),
            pending: PendingOperations::default(),
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config,
                transport: Box::new(transport),
                core: Mutex::new(core),
                state_tx,
                events_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.shared.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().controller.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Most recent error reported by the transport since the last successful
    /// connect.
    pub fn last_error(&self) -> Option<TransportError> {
        self.lock().controller.last_error().cloned()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Starts connecting and returns immediately.
    ///
    /// Does nothing while an attempt is in flight or a transport handle is
    /// live. Progress is observable through [`Self::watch_state`].
    pub fn connect(&self) {
        let (transition, generation) = {
            let mut core = self.lock();
            match core.controller.begin_connect() {
                Some(transition) => (transition, core.controller.generation()),
                None => return,
            }
        };
        self.notify_state(transition);

        info!("Connecting to {}", self.shared.config.url);
        match self
            .shared
            .transport
            .open(&self.shared.config, self.sink(generation))
        {
            Ok(handle) => {
                let (attached, connected) = {
                    let mut core = self.lock();
                    let attached = core.controller.attach(generation, handle.clone());
                    (attached, core.controller.state().is_connected())
                };
                if !attached {
                    debug!("Connection attempt superseded, closing new handle");
                    handle.close(true);
                    return;
                }
                // The transport may have reported success before we got the handle
                if connected {
                    self.reconcile();
                }
            }
            Err(e) => {
                let transition = self.lock().controller.open_failed(generation, e);
                if let Some(transition) = transition {
                    self.notify_state(transition);
                }
            }
        }
    }

    /// Tears the session down: closes the transport handle, rejects every
    /// in-flight operation with [`SessionError::Disconnected`], clears the
    /// history and resets the subscription sets to the configured topics.
    pub fn disconnect(&self) {
        let (transition, handle, abandoned, subscriptions_changed, history_changed) = {
            let mut core = self.lock();
            if core.controller.is_idle() {
                debug!("disconnect() ignored, already disconnected");
                return;
            }
            let subscriptions_changed = core.registry.acknowledged().next().is_some();
            let (transition, handle) = core.controller.teardown();
            core.registry.reset();
            let history_changed = core.dispatcher.clear_history();
            let abandoned = core.pending.drain();
            (
                transition,
                handle,
                abandoned,
                subscriptions_changed,
                history_changed,
            )
        };

        if let Some(handle) = handle {
            handle.close(true);
        }
        info!(
            "Disconnected, {} pending operation(s) abandoned",
            abandoned.len()
        );
        for op in abandoned {
            op.settle(Err(SessionError::Disconnected));
        }

        self.notify_state(transition);
        if subscriptions_changed {
            self.notify(SessionEvent::SubscriptionsChanged);
        }
        if history_changed {
            self.notify(SessionEvent::HistoryChanged);
        }
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Payload>) -> Outcome {
        self.publish_with(topic, payload, PublishOptions::default(), None)
    }

    /// Publishes `value` as JSON with sorted object keys.
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<Outcome, serde_json::Error> {
        Ok(self.publish(topic, Payload::json(value)?))
    }

    /// Publishes with explicit options and an optional completion callback.
    ///
    /// The callback and the returned [`Outcome`] always receive the same
    /// result, exactly once. While not connected the publish fails with
    /// [`SessionError::NotReady`] without reaching the transport.
    pub fn publish_with(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
        callback: Option<Callback>,
    ) -> Outcome {
        let mut callback = callback;
        let prepared = {
            let mut core = self.lock();
            match core.ready_handle() {
                Ok(handle) => {
                    let epoch = core.controller.epoch();
                    let (op, outcome) = PendingOperation::awaited(
                        OperationKind::Publish,
                        vec![topic.to_string()],
                        callback.take(),
                    );
                    let id = core.pending.insert(op.in_epoch(epoch));
                    Ok((handle, id, outcome))
                }
                Err(e) => Err(e),
            }
        };

        let (handle, id, outcome) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!("Publish to {} rejected: {}", topic, e);
                return settle_now(Err(e), callback);
            }
        };

        handle.publish(topic, payload.into().into_bytes(), options, self.completion(id));
        outcome
    }

    /// Subscribes to `topics`.
    ///
    /// The topics join the desired set before the request is sent and stay
    /// there even if the broker refuses, so the next reconnect retries them.
    pub fn subscribe<I, S>(&self, topics: I) -> Outcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_with(topics, None)
    }

    /// [`Self::subscribe`] with an optional completion callback that receives
    /// the same result as the returned [`Outcome`].
    pub fn subscribe_with<I, S>(&self, topics: I, callback: Option<Callback>) -> Outcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = collect_topics(topics);
        let mut callback = callback;
        let prepared = {
            let mut core = self.lock();
            match core.ready_handle() {
                Ok(_) if topics.is_empty() => Ok(None),
                Ok(handle) => {
                    core.registry.request(&topics);
                    let epoch = core.controller.epoch();
                    let (op, outcome) = PendingOperation::awaited(
                        OperationKind::Subscribe,
                        topics.clone(),
                        callback.take(),
                    );
                    let id = core.pending.insert(op.in_epoch(epoch));
                    Ok(Some((handle, id, outcome)))
                }
                Err(e) => Err(e),
            }
        };

        match prepared {
            Ok(Some((handle, id, outcome))) => {
                handle.subscribe(topics, self.completion(id));
                outcome
            }
            Ok(None) => settle_now(Ok(()), callback),
            Err(e) => {
                debug!("Subscribe to {:?} rejected: {}", topics, e);
                settle_now(Err(e), callback)
            }
        }
    }

    /// Unsubscribes from `topics`. Topics that were never subscribed are
    /// passed to the broker like any other and are not an error.
    pub fn unsubscribe<I, S>(&self, topics: I) -> Outcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unsubscribe_with(topics, None)
    }

    pub fn unsubscribe_with<I, S>(&self, topics: I, callback: Option<Callback>) -> Outcome
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = collect_topics(topics);
        let mut callback = callback;
        let prepared = {
            let mut core = self.lock();
            match core.ready_handle() {
                Ok(_) if topics.is_empty() => Ok(None),
                Ok(handle) => {
                    let epoch = core.controller.epoch();
                    let (op, outcome) = PendingOperation::awaited(
                        OperationKind::Unsubscribe,
                        topics.clone(),
                        callback.take(),
                    );
                    let id = core.pending.insert(op.in_epoch(epoch));
                    Ok(Some((handle, id, outcome)))
                }
                Err(e) => Err(e),
            }
        };

        match prepared {
            Ok(Some((handle, id, outcome))) => {
                handle.unsubscribe(topics, self.completion(id));
                outcome
            }
            Ok(None) => settle_now(Ok(()), callback),
            Err(e) => {
                debug!("Unsubscribe from {:?} rejected: {}", topics, e);
                settle_now(Err(e), callback)
            }
        }
    }

    /// Whether the broker has acknowledged `topic` on the current connection.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().registry.is_subscribed(topic)
    }

    /// Acknowledged topics, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().registry.acknowledged().cloned().collect()
    }

    /// Desired topics, sorted.
    pub fn desired_topics(&self) -> Vec<String> {
        self.lock().registry.desired().cloned().collect()
    }

    /// Registers `listener` for messages whose topic equals `topic`. It is
    /// only invoked while `topic` is acknowledged.
    pub fn on_message<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&InboundMessage) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.lock().dispatcher.add_listener(topic, Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.lock().dispatcher.remove_listener(id)
    }

    /// Channel view of one topic, fed by a listener. The channel holds at
    /// most [`HISTORY_CAPACITY`] messages; while it is full new messages are
    /// dropped and reported as a listener failure.
    pub fn messages(
        &self,
        topic: impl Into<String>,
    ) -> (ListenerId, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(HISTORY_CAPACITY);
        let id = self.on_message(topic, move |message| match tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(dropped)) => Err(format!(
                "message channel full, dropped message on {}",
                dropped.topic()
            )
            .into()),
            // A dropped receiver only means nobody is watching any more
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        });
        (id, rx)
    }

    /// Snapshot of the history, oldest first.
    pub fn history(&self) -> Vec<InboundMessage> {
        self.lock().dispatcher.history().to_vec()
    }

    pub fn history_for(&self, topic: &str) -> Vec<InboundMessage> {
        self.lock().dispatcher.history().for_topic(topic)
    }

    pub fn clear_history(&self) {
        let changed = self.lock().dispatcher.clear_history();
        if changed {
            self.notify(SessionEvent::HistoryChanged);
        }
    }

    pub fn pending_operations(&self) -> usize {
        self.lock().pending.len()
    }

    fn sink(&self, generation: u64) -> EventSink {
        let shared = Arc::downgrade(&self.shared);
        EventSink::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                Session { shared }.handle_event(generation, event);
            }
        })
    }

    fn completion(&self, id: u64) -> Completion {
        let shared = Arc::downgrade(&self.shared);
        Box::new(move |result| {
            if let Some(shared) = shared.upgrade() {
                Session { shared }.resolve(id, result);
            }
        })
    }

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        let (topic, payload) = match event {
            TransportEvent::Message { topic, payload } => (topic, payload),
            lifecycle => return self.handle_lifecycle(generation, lifecycle),
        };

        let (message, listeners) = {
            let mut guard = self.lock();
            if !guard.controller.is_current(generation) {
                debug!("Dropping message on {} from a closed connection", topic);
                return;
            }
            let core = &mut *guard;
            let message = InboundMessage::new(topic, payload);
            let listeners = core.dispatcher.record(message.clone(), &core.registry);
            (message, listeners)
        };

        debug!(
            "Message on {} ({} bytes, {} listener(s))",
            message.topic(),
            message.payload().len(),
            listeners.len()
        );
        self.notify(SessionEvent::HistoryChanged);
        MessageDispatcher::deliver(&message, &listeners);
    }

    fn handle_lifecycle(&self, generation: u64, event: TransportEvent) {
        let (transition, lost) = {
            let mut core = self.lock();
            if !core.controller.is_current(generation) {
                debug!("Ignoring {} from a closed connection", event);
                return;
            }
            let transition = core.controller.apply(&event);
            let lost = transition.left_connected() && core.registry.connection_lost();
            (transition, lost)
        };

        self.notify_state(transition);
        if lost {
            self.notify(SessionEvent::SubscriptionsChanged);
        }
        if transition.entered_connected() {
            self.reconcile();
        }
    }

    /// Re-subscribes every desired topic the broker has not acknowledged on
    /// this connection.
    fn reconcile(&self) {
        let (handle, topics, id) = {
            let mut core = self.lock();
            let Ok(handle) = core.ready_handle() else {
                return;
            };
            let topics = core.registry.begin_reconciliation();
            if topics.is_empty() {
                return;
            }
            let epoch = core.controller.epoch();
            let op = PendingOperation::background(OperationKind::Resubscribe, topics.clone());
            let id = core.pending.insert(op.in_epoch(epoch));
            (handle, topics, id)
        };

        info!("Re-subscribing {} topic(s): {:?}", topics.len(), topics);
        handle.subscribe(topics, self.completion(id));
    }

    fn resolve(&self, id: u64, result: Result<(), TransportError>) {
        let (op, changed) = {
            let mut core = self.lock();
            let Some(op) = core.pending.take(id) else {
                debug!("Completion for settled operation #{} ignored", id);
                return;
            };
            let same_epoch = op.epoch == core.controller.epoch();
            let live = same_epoch && core.controller.state().is_connected();

            let changed = match op.kind {
                OperationKind::Subscribe | OperationKind::Resubscribe => {
                    if op.kind == OperationKind::Resubscribe && same_epoch {
                        core.registry.end_reconciliation(&op.topics);
                    }
                    result.is_ok() && live && core.registry.confirm(&op.topics)
                }
                OperationKind::Unsubscribe => result.is_ok() && core.registry.remove(&op.topics),
                OperationKind::Publish => false,
            };
            (op, changed)
        };

        match &result {
            Ok(()) => debug!("{} {:?} succeeded", op.kind, op.topics),
            Err(e) => warn!("{} {:?} failed: {}", op.kind, op.topics, e),
        }
        if changed {
            self.notify(SessionEvent::SubscriptionsChanged);
        }
        op.settle(result.map_err(SessionError::from));
    }

    fn notify_state(&self, transition: Transition) {
        if !transition.changed() {
            return;
        }
        self.shared.state_tx.send_replace(transition.to);
        self.notify(SessionEvent::StateChanged(transition.to));
    }

    fn notify(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.shared.events_tx.send(event);
    }
}

/// Resolves an operation that never reached the transport.
fn settle_now(result: Result<(), SessionError>, callback: Option<Callback>) -> Outcome {
    if let Some(callback) = callback {
        callback(result.clone());
    }
    Outcome::ready(result)
}

/// Collects topics, dropping duplicates but keeping first-seen order.
fn collect_topics<I, S>(topics: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = BTreeSet::new();
    topics
        .into_iter()
        .map(Into::into)
        .filter(|topic: &String| seen.insert(topic.clone()))
        .collect()
}
