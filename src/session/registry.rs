//! Subscription Registry
//!
//! Tracks two topic sets:
//!
//! - **desired**: what the application wants. Survives reconnects and is
//!   only shrunk by an acknowledged unsubscribe or a full teardown.
//! - **acknowledged**: what the broker confirmed on the current connection.
//!   Cleared whenever the connection is lost.
//!
//! Reconciliation re-subscribes `desired - acknowledged` after every
//! (re)connect. Topics already being reconciled are excluded so that repeated
//! connect events never issue duplicate requests.

use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    declared: Vec<String>,
    desired: BTreeSet<String>,
    acknowledged: BTreeSet<String>,
    reconciling: BTreeSet<String>,
}

impl SubscriptionRegistry {
    /// Creates a registry whose desired set is seeded with `declared`.
    pub fn new(declared: &[String]) -> Self {
        let mut registry = Self {
            declared: declared.to_vec(),
            ..Self::default()
        };
        registry.reset();
        registry
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.acknowledged.contains(topic)
    }

    #[cfg(test)]
    pub fn is_desired(&self, topic: &str) -> bool {
        self.desired.contains(topic)
    }

    pub fn desired(&self) -> impl Iterator<Item = &String> {
        self.desired.iter()
    }

    pub fn acknowledged(&self) -> impl Iterator<Item = &String> {
        self.acknowledged.iter()
    }

    /// Records an explicit subscribe request before it is sent.
    pub fn request(&mut self, topics: &[String]) {
        self.desired.extend(topics.iter().cloned());
    }

    /// The broker confirmed `topics`. Returns whether the acknowledged set grew.
    pub fn confirm(&mut self, topics: &[String]) -> bool {
        let mut changed = false;
        for topic in topics {
            self.desired.insert(topic.clone());
            changed |= self.acknowledged.insert(topic.clone());
        }
        changed
    }

    /// The broker confirmed an unsubscribe. Returns whether the acknowledged
    /// set shrank.
    pub fn remove(&mut self, topics: &[String]) -> bool {
        let mut changed = false;
        for topic in topics {
            self.desired.remove(topic);
            self.reconciling.remove(topic);
            changed |= self.acknowledged.remove(topic);
        }
        changed
    }

    /// Topics that still need a subscribe on this connection. They are marked
    /// as in flight until [`Self::end_reconciliation`].
    pub fn begin_reconciliation(&mut self) -> Vec<String> {
        let missing: Vec<String> = self
            .desired
            .iter()
            .filter(|t| !self.acknowledged.contains(*t) && !self.reconciling.contains(*t))
            .cloned()
            .collect();
        self.reconciling.extend(missing.iter().cloned());
        missing
    }

    pub fn end_reconciliation(&mut self, topics: &[String]) {
        for topic in topics {
            self.reconciling.remove(topic);
        }
    }

    /// The connection went away; nothing is acknowledged any more.
    pub fn connection_lost(&mut self) -> bool {
        let changed = !self.acknowledged.is_empty();
        if changed {
            debug!(
                "Connection lost, {} acknowledged topic(s) cleared",
                self.acknowledged.len()
            );
        }
        self.acknowledged.clear();
        self.reconciling.clear();
        changed
    }

    /// Full teardown: desired falls back to the declared topics.
    pub fn reset(&mut self) {
        self.acknowledged.clear();
        self.reconciling.clear();
        self.desired = self.declared.iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn declared_topics_seed_desired() {
        let registry = SubscriptionRegistry::new(&topics(&["a", "b"]));
        assert!(registry.is_desired("a"));
        assert!(registry.is_desired("b"));
        assert!(!registry.is_subscribed("a"));
    }

    #[test]
    fn failed_request_stays_desired_but_unacknowledged() {
        let mut registry = SubscriptionRegistry::default();
        registry.request(&topics(&["a"]));
        assert!(registry.is_desired("a"));
        assert!(!registry.is_subscribed("a"));
    }

    #[test]
    fn confirm_is_idempotent() {
        let mut registry = SubscriptionRegistry::default();
        assert!(registry.confirm(&topics(&["a"])));
        assert!(!registry.confirm(&topics(&["a"])));
        assert!(registry.is_subscribed("a"));
        assert!(registry.is_desired("a"));
    }

    #[test]
    fn reconciliation_covers_missing_topics_once() {
        let mut registry = SubscriptionRegistry::new(&topics(&["a", "b", "c"]));
        registry.confirm(&topics(&["b"]));

        assert_eq!(registry.begin_reconciliation(), topics(&["a", "c"]));
        // Already in flight
        assert!(registry.begin_reconciliation().is_empty());

        registry.end_reconciliation(&topics(&["a", "c"]));
        assert_eq!(registry.begin_reconciliation(), topics(&["a", "c"]));
    }

    #[test]
    fn connection_lost_keeps_desired() {
        let mut registry = SubscriptionRegistry::default();
        registry.confirm(&topics(&["a"]));
        assert!(registry.connection_lost());
        assert!(!registry.is_subscribed("a"));
        assert!(registry.is_desired("a"));
        assert_eq!(registry.begin_reconciliation(), topics(&["a"]));
        assert!(!registry.connection_lost());
    }

    #[test]
    fn remove_ignores_unknown_topics() {
        let mut registry = SubscriptionRegistry::default();
        registry.confirm(&topics(&["a"]));
        assert!(registry.remove(&topics(&["a", "b"])));
        assert!(!registry.is_subscribed("a"));
        assert!(!registry.is_desired("b"));
        assert!(!registry.remove(&topics(&["b"])));
    }

    #[test]
    fn reset_restores_declared_topics_only() {
        let mut registry = SubscriptionRegistry::new(&topics(&["declared"]));
        registry.confirm(&topics(&["declared", "extra"]));
        registry.reset();
        assert_eq!(registry.desired().collect::<Vec<_>>(), vec!["declared"]);
        assert_eq!(registry.acknowledged().count(), 0);
    }
}
