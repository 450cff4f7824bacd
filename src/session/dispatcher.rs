//! Message Dispatcher
//!
//! Every inbound frame is appended to the session history first and then
//! fanned out to the listeners registered for its topic. Topic matching is
//! exact string equality; protocol wildcards (`+`, `#`) are not interpreted.
//!
//! Listeners are kept per topic in registration order, but a listener only
//! fires while its topic is acknowledged by the broker. Both checks happen
//! under the session lock, so attaching and detaching is atomic with changes
//! to the acknowledged set.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::history::HistoryBuffer;
use super::message::InboundMessage;
use super::registry::SubscriptionRegistry;

/// Error a listener may report. It is logged and never stops delivery to the
/// remaining listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback receiving messages for one topic.
pub type Listener = Arc<dyn Fn(&InboundMessage) -> Result<(), ListenerError> + Send + Sync>;

/// Identifies a registered listener for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    topic: String,
    listener: Listener,
}

pub(crate) struct MessageDispatcher {
    history: HistoryBuffer,
    listeners: Vec<Registration>,
    next_id: u64,
}

impl MessageDispatcher {
    pub fn new(history: HistoryBuffer) -> Self {
        Self {
            history,
            listeners: Vec::new(),
            next_id: 0,
        }
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn clear_history(&mut self) -> bool {
        let had_entries = !self.history.is_empty();
        self.history.clear();
        had_entries
    }

    pub fn add_listener(&mut self, topic: impl Into<String>, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        let topic = topic.into();
        debug!("Listener {:?} registered for {}", id, topic);
        self.listeners.push(Registration {
            id,
            topic,
            listener,
        });
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|r| r.id != id);
        before != self.listeners.len()
    }

    #[cfg(test)]
    pub fn listener_count(&self, topic: &str) -> usize {
        self.listeners.iter().filter(|r| r.topic == topic).count()
    }

    /// Records `message` in the history and returns the listeners it must be
    /// delivered to, in registration order.
    pub fn record(
        &mut self,
        message: InboundMessage,
        registry: &SubscriptionRegistry,
    ) -> Vec<Listener> {
        let active = registry.is_subscribed(message.topic());
        let listeners = if active {
            self.listeners
                .iter()
                .filter(|r| r.topic == message.topic())
                .map(|r| r.listener.clone())
                .collect()
        } else {
            Vec::new()
        };
        self.history.push(message);
        listeners
    }

    /// Invokes every listener with `message`. A listener that fails or panics
    /// is logged and skipped. Returns how many listeners succeeded.
    pub fn deliver(message: &InboundMessage, listeners: &[Listener]) -> usize {
        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Listener for {} failed: {}", message.topic(), e),
                Err(_) => error!("Listener for {} panicked", message.topic()),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn acknowledged(topics: &[&str]) -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::default();
        let topics: Vec<String> = topics.iter().map(|s| s.to_string()).collect();
        registry.confirm(&topics);
        registry
    }

    fn listener(
        f: impl Fn(&InboundMessage) -> Result<(), ListenerError> + Send + Sync + 'static,
    ) -> Listener {
        Arc::new(f)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Listener {
        let log = log.clone();
        listener(move |m| {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", name, m.payload_str().unwrap_or_default()));
            Ok(())
        })
    }

    #[test]
    fn records_every_message_even_without_listeners() {
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        let registry = SubscriptionRegistry::default();

        let listeners = dispatcher.record(InboundMessage::new("nobody/listens", "x"), &registry);
        assert!(listeners.is_empty());
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[test]
    fn delivers_in_registration_order_to_exact_topic_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        dispatcher.add_listener("a", recorder(&log, "first"));
        dispatcher.add_listener("a/#", recorder(&log, "wildcard"));
        dispatcher.add_listener("a", recorder(&log, "second"));
        let registry = acknowledged(&["a", "a/#"]);

        let message = InboundMessage::new("a", "1");
        let listeners = dispatcher.record(message.clone(), &registry);
        assert_eq!(MessageDispatcher::deliver(&message, &listeners), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn listeners_are_inactive_until_topic_is_acknowledged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        dispatcher.add_listener("a", recorder(&log, "l"));

        let registry = SubscriptionRegistry::default();
        let listeners = dispatcher.record(InboundMessage::new("a", "1"), &registry);
        assert!(listeners.is_empty());
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        dispatcher.add_listener("a", listener(|_| Err("nope".into())));
        dispatcher.add_listener("a", listener(|_| panic!("listener bug")));
        dispatcher.add_listener("a", recorder(&log, "ok"));
        let registry = acknowledged(&["a"]);

        let message = InboundMessage::new("a", "1");
        let listeners = dispatcher.record(message.clone(), &registry);
        assert_eq!(MessageDispatcher::deliver(&message, &listeners), 1);
        assert_eq!(*log.lock().unwrap(), vec!["ok:1"]);
    }

    #[test]
    fn removed_listener_is_not_invoked() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        let id = dispatcher.add_listener("a", recorder(&log, "gone"));
        assert_eq!(dispatcher.listener_count("a"), 1);
        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));

        let registry = acknowledged(&["a"]);
        let listeners = dispatcher.record(InboundMessage::new("a", "1"), &registry);
        assert!(listeners.is_empty());
    }

    #[test]
    fn clear_history_reports_change() {
        let mut dispatcher = MessageDispatcher::new(HistoryBuffer::default());
        assert!(!dispatcher.clear_history());
        dispatcher.record(InboundMessage::new("a", "1"), &SubscriptionRegistry::default());
        assert!(dispatcher.clear_history());
        assert!(dispatcher.history().is_empty());
    }
}
