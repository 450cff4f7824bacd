use std::collections::VecDeque;

use super::message::InboundMessage;

/// Maximum number of messages kept in the session history.
pub const HISTORY_CAPACITY: usize = 100;

/// Bounded FIFO log of inbound messages, in arrival order.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<InboundMessage>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl HistoryBuffer {
    /// Creates a buffer holding at most `capacity` messages, never more than
    /// [`HISTORY_CAPACITY`].
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(HISTORY_CAPACITY);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `message`, evicting the oldest entry when full.
    pub fn push(&mut self, message: InboundMessage) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &InboundMessage> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<InboundMessage> {
        self.entries.iter().cloned().collect()
    }

    /// Messages whose topic equals `topic` exactly.
    pub fn for_topic(&self, topic: &str) -> Vec<InboundMessage> {
        self.entries
            .iter()
            .filter(|m| m.topic() == topic)
            .cloned()
            .collect()
    }
}
