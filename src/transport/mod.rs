//! # Transport Adapter
//!
//! The session core never speaks a wire protocol itself. It drives a
//! [`Transport`] that can open a broker connection, and a
//! [`TransportHandle`] for the connection it opened. Everything the transport
//! observes flows back as [`TransportEvent`]s through the [`EventSink`] it was
//! given at `open` time.
//!
//! ```text
//! Session ──open(config, sink)──► Transport ──► TransportHandle
//!    ▲                                             │
//!    └──────────── EventSink::emit(event) ◄────────┘
//! ```
//!
//! Request completions are plain callbacks ([`Completion`]) that the
//! transport invokes exactly once with the outcome of the round trip.
//!
//! [`mqtt::MqttTransport`] is the production adapter built on rumqttc.

pub mod event;
pub mod mqtt;

#[cfg(test)]
pub(crate) mod mock;

pub use event::{PublishOptions, TransportEvent};

use std::sync::{Arc, Mutex, PoisonError};

use crate::config::ConnectionConfig;
use crate::error::TransportError;

/// Callback receiving the outcome of a single transport request.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Opens broker connections.
pub trait Transport: Send + Sync {
    /// Starts a connection attempt and returns immediately. Lifecycle and
    /// message events for the new connection are reported through `events`.
    fn open(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError>;
}

/// One live broker connection.
pub trait TransportHandle: Send + Sync {
    /// Closes the connection. `force` skips any graceful protocol goodbye.
    fn close(&self, force: bool);

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        completion: Completion,
    );

    fn subscribe(&self, topics: Vec<String>, completion: Completion);

    fn unsubscribe(&self, topics: Vec<String>, completion: Completion);
}

/// Destination for events emitted by a transport connection.
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(emit: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Splits one completion into `parts` completions.
///
/// The original completion fires once: with the first failure reported by
/// any part, or with success after every part succeeded.
pub fn split_completion(completion: Completion, parts: usize) -> Vec<Completion> {
    if parts == 0 {
        completion(Ok(()));
        return Vec::new();
    }

    struct Join {
        remaining: usize,
        completion: Option<Completion>,
    }

    let join = Arc::new(Mutex::new(Join {
        remaining: parts,
        completion: Some(completion),
    }));

    (0..parts)
        .map(|_| {
            let join = join.clone();
            Box::new(move |result: Result<(), TransportError>| {
                let ready = {
                    let mut join = join.lock().unwrap_or_else(PoisonError::into_inner);
                    join.remaining = join.remaining.saturating_sub(1);
                    match result {
                        Err(e) => join.completion.take().map(|c| (c, Err(e))),
                        Ok(()) if join.remaining == 0 => {
                            join.completion.take().map(|c| (c, Ok(())))
                        }
                        Ok(()) => None,
                    }
                };
                if let Some((completion, result)) = ready {
                    completion(result);
                }
            }) as Completion
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (Completion, Arc<Mutex<Vec<Result<(), TransportError>>>>) {
        let seen: Arc<Mutex<Vec<Result<(), TransportError>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let completion: Completion =
            Box::new(move |r: Result<(), TransportError>| sink.lock().unwrap().push(r));
        (completion, seen)
    }

    #[test]
    fn split_completion_waits_for_all_parts() {
        let (completion, seen) = recording();
        let mut parts = split_completion(completion, 3);

        parts.remove(0)(Ok(()));
        parts.remove(0)(Ok(()));
        assert!(seen.lock().unwrap().is_empty());

        parts.remove(0)(Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![Ok(())]);
    }

    #[test]
    fn split_completion_reports_first_failure_once() {
        let (completion, seen) = recording();
        let mut parts = split_completion(completion, 2);

        parts.remove(0)(Err(TransportError::new("refused")));
        parts.remove(0)(Err(TransportError::new("also refused")));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Err(TransportError::new("refused"))]
        );
    }

    #[test]
    fn split_completion_with_no_parts_succeeds_immediately() {
        let (completion, seen) = recording();
        assert!(split_completion(completion, 0).is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![Ok(())]);
    }
}
