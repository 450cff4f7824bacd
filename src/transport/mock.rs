//! Scriptable in-memory transport for session tests.
//!
//! Records every request, keeps completions until the test resolves them and
//! lets the test emit lifecycle and message events as if they came from a
//! broker connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{Completion, EventSink, PublishOptions, Transport, TransportEvent, TransportHandle};
use crate::config::ConnectionConfig;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open(String),
    Close { force: bool },
    Publish { topic: String, payload: Vec<u8>, options: PublishOptions },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    sinks: Vec<EventSink>,
    completions: VecDeque<(Call, Completion)>,
    auto_ack: bool,
    fail_open: Option<TransportError>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes every request successfully as soon as it is made.
    pub fn auto_ack(self) -> Self {
        self.state.lock().unwrap().auto_ack = true;
        self
    }

    pub fn fail_next_open(&self, error: TransportError) {
        self.state.lock().unwrap().fail_open = Some(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn opens(&self) -> usize {
        self.count(|c| matches!(c, Call::Open(_)))
    }

    pub fn publishes(&self) -> usize {
        self.count(|c| matches!(c, Call::Publish { .. }))
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Subscribe(topics) => Some(topics),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    /// Emits an event on the most recently opened connection.
    pub fn emit(&self, event: TransportEvent) {
        let sink = self.state.lock().unwrap().sinks.last().cloned();
        sink.expect("no connection opened").emit(event);
    }

    /// Emits an event on a specific (possibly stale) connection.
    pub fn emit_on(&self, connection: usize, event: TransportEvent) {
        let sink = self.state.lock().unwrap().sinks[connection].clone();
        sink.emit(event);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().completions.len()
    }

    /// Resolves the oldest outstanding request.
    pub fn complete_next(&self, result: Result<(), TransportError>) -> Call {
        let (call, completion) = self
            .state
            .lock()
            .unwrap()
            .completions
            .pop_front()
            .expect("no outstanding request");
        completion(result);
        call
    }

    /// Resolves the outstanding request at `index` (in issue order).
    pub fn complete_at(&self, index: usize, result: Result<(), TransportError>) -> Call {
        let (call, completion) = self
            .state
            .lock()
            .unwrap()
            .completions
            .remove(index)
            .expect("no outstanding request at index");
        completion(result);
        call
    }

    fn record(&self, call: Call, completion: Option<Completion>) {
        let auto = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            match completion {
                Some(c) if state.auto_ack => Some(c),
                Some(c) => {
                    state.completions.push_back((call, c));
                    None
                }
                None => None,
            }
        };
        if let Some(completion) = auto {
            completion(Ok(()));
        }
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Open(config.url.clone()));
        if let Some(e) = state.fail_open.take() {
            return Err(e);
        }
        state.sinks.push(events);
        Ok(Arc::new(self.clone()))
    }
}

impl TransportHandle for MockTransport {
    fn close(&self, force: bool) {
        self.record(Call::Close { force }, None);
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        completion: Completion,
    ) {
        self.record(
            Call::Publish {
                topic: topic.to_string(),
                payload,
                options,
            },
            Some(completion),
        );
    }

    fn subscribe(&self, topics: Vec<String>, completion: Completion) {
        self.record(Call::Subscribe(topics), Some(completion));
    }

    fn unsubscribe(&self, topics: Vec<String>, completion: Completion) {
        self.record(Call::Unsubscribe(topics), Some(completion));
    }
}
