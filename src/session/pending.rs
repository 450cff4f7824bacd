//! In-flight publish, subscribe and unsubscribe requests.
//!
//! Each request gets an entry keyed by a session-unique id. The transport
//! completion for that request looks the entry up again; whoever removes the
//! entry first (the completion or a teardown) settles it, so every operation
//! resolves exactly once.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;
use tracing::debug;

use super::outcome::Outcome;
use crate::error::SessionError;

/// Completion callback accepted next to the returned [`Outcome`].
pub type Callback = Box<dyn FnOnce(Result<(), SessionError>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Publish,
    Subscribe,
    Unsubscribe,
    /// Subscribe issued by reconciliation; nobody awaits it
    Resubscribe,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OperationKind::Publish => "publish",
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::Resubscribe => "resubscribe",
        };
        f.write_str(name)
    }
}

pub(crate) struct PendingOperation {
    pub kind: OperationKind,
    pub topics: Vec<String>,
    /// Connection epoch the request was issued in
    pub epoch: u64,
    reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    callback: Option<Callback>,
}

impl PendingOperation {
    /// Creates an operation together with the outcome its caller awaits.
    pub fn awaited(
        kind: OperationKind,
        topics: Vec<String>,
        callback: Option<Callback>,
    ) -> (Self, Outcome) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            kind,
            topics,
            epoch: 0,
            reply: Some(tx),
            callback,
        };
        (op, Outcome::waiting(rx))
    }

    pub fn background(kind: OperationKind, topics: Vec<String>) -> Self {
        Self {
            kind,
            topics,
            epoch: 0,
            reply: None,
            callback: None,
        }
    }

    pub fn in_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Delivers `result` to the awaiting caller and the callback, if any.
    pub fn settle(self, result: Result<(), SessionError>) {
        if let Some(reply) = self.reply {
            // The caller may have dropped its outcome
            let _ = reply.send(result.clone());
        }
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingOperations {
    next_id: u64,
    ops: HashMap<u64, PendingOperation>,
}

impl PendingOperations {
    pub fn insert(&mut self, op: PendingOperation) -> u64 {
        self.next_id += 1;
        debug!("Operation #{} started: {} {:?}", self.next_id, op.kind, op.topics);
        self.ops.insert(self.next_id, op);
        self.next_id
    }

    pub fn take(&mut self, id: u64) -> Option<PendingOperation> {
        self.ops.remove(&id)
    }

    pub fn drain(&mut self) -> Vec<PendingOperation> {
        self.ops.drain().map(|(_, op)| op).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
