//! rumqttc-backed transport.
//!
//! Each `open` builds a fresh `AsyncClient`/`EventLoop` pair and drives the
//! event loop on its own tokio task. The task translates rumqttc events into
//! [`TransportEvent`]s and settles request completions:
//!
//! - publish (QoS 0): once the PUBLISH packet has been written
//! - subscribe: on SUBACK, failing if the broker rejected any filter
//! - unsubscribe: on UNSUBACK
//!
//! Requests are correlated by order: rumqttc processes requests in the order
//! they were queued and reports the packet id it assigned through an
//! `Outgoing` event, which moves the completion from the queue into the
//! packet-id table. rumqttc reconnects on its own when polled after an error;
//! this task only waits `reconnect_period` before polling again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    split_completion, Completion, EventSink, PublishOptions, Transport, TransportEvent,
    TransportHandle,
};
use crate::config::ConnectionConfig;
use crate::error::TransportError;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Host, port and TLS flag extracted from a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Accepts `mqtt://`, `tcp://`, `broker://` (plain) and `mqtts://`,
    /// `ssl://` (TLS) URLs, or a bare `host[:port]`.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let url = url.trim();
        let (tls, rest) = match url.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "mqtt" | "tcp" | "broker" => (false, rest),
                "mqtts" | "ssl" | "tls" => (true, rest),
                other => {
                    return Err(TransportError::new(format!(
                        "Unsupported broker URL scheme: {}",
                        other
                    )))
                }
            },
            None => (false, url),
        };

        // Drop any path or query component
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let authority = authority.rsplit('@').next().unwrap_or_default();

        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    TransportError::new(format!("Invalid port in broker URL: {}", port))
                })?;
                (host, port)
            }
            None => (authority, default_port),
        };

        if host.is_empty() {
            return Err(TransportError::new(format!(
                "Broker URL has no host: {}",
                url
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Builds the rumqttc options for a session configuration.
pub fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, TransportError> {
    let address = BrokerAddress::parse(&config.url)?;
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(generated_client_id);

    let mut options = MqttOptions::new(client_id, address.host, address.port);
    options
        .set_clean_session(config.clean_session)
        .set_keep_alive(Duration::from_secs(
            config
                .extra_value("keep_alive_secs")
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS)
                .max(1),
        ));

    if let Some(username) = &config.username {
        options.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }
    if let Some(size) = config.extra_value::<usize>("max_packet_size") {
        options.set_max_packet_size(size, size);
    }
    if address.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    Ok(options)
}

/// rumqttc takes whole seconds; partial seconds round up, never to zero.
fn connection_timeout_secs(config: &ConnectionConfig) -> u64 {
    let timeout = config.connect_timeout();
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

fn generated_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("mqtt-session-{}-{:08x}", std::process::id(), nanos)
}

/// Completions waiting for their packet to be written or acknowledged.
#[derive(Default)]
struct InFlight {
    publishes: VecDeque<Completion>,
    queued_subscribes: VecDeque<Completion>,
    queued_unsubscribes: VecDeque<Completion>,
    subscribes: HashMap<u16, Completion>,
    unsubscribes: HashMap<u16, Completion>,
}

impl InFlight {
    fn take_sent(&mut self) -> Vec<Completion> {
        self.subscribes
            .drain()
            .chain(self.unsubscribes.drain())
            .map(|(_, c)| c)
            .collect()
    }

    fn take_all(&mut self) -> Vec<Completion> {
        let mut all = self.take_sent();
        all.extend(self.publishes.drain(..));
        all.extend(self.queued_subscribes.drain(..));
        all.extend(self.queued_unsubscribes.drain(..));
        all
    }
}

#[derive(Clone, Default)]
struct SharedInFlight(Arc<Mutex<InFlight>>);

impl SharedInFlight {
    fn lock(&self) -> MutexGuard<'_, InFlight> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(completions: Vec<Completion>, error: &TransportError) {
        for completion in completions {
            completion(Err(error.clone()));
        }
    }
}

/// Production transport speaking MQTT 3.1.1 through rumqttc.
#[derive(Debug, Clone, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for MqttTransport {
    fn open(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::new(format!("No tokio runtime available: {}", e)))?;

        let options = mqtt_options(config)?;
        let capacity = config
            .extra_value("channel_capacity")
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (client, mut eventloop) = AsyncClient::new(options, capacity);
        eventloop
            .network_options
            .set_connection_timeout(connection_timeout_secs(config));

        let in_flight = SharedInFlight::default();
        let cancel = CancellationToken::new();

        info!("Opening MQTT connection to {}", config.url);
        runtime.spawn(run_event_loop(
            eventloop,
            EventRouter::new(in_flight.clone(), events),
            cancel.clone(),
            config.reconnect_period(),
        ));

        Ok(Arc::new(MqttHandle {
            client,
            in_flight,
            cancel,
        }))
    }
}

struct MqttHandle {
    client: AsyncClient,
    in_flight: SharedInFlight,
    cancel: CancellationToken,
}

impl MqttHandle {
    fn closed_error() -> TransportError {
        TransportError::new("Connection closed")
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        // The event loop holds its own request sender and never sees the
        // client go away, so it has to be stopped explicitly
        self.cancel.cancel();
    }
}

impl TransportHandle for MqttHandle {
    fn close(&self, force: bool) {
        debug!("Closing MQTT connection (force: {})", force);
        // A graceful close lets the event loop stop after writing DISCONNECT
        let graceful = !force && self.client.try_disconnect().is_ok();
        if !graceful {
            self.cancel.cancel();
        }

        let abandoned = self.in_flight.lock().take_all();
        SharedInFlight::fail(abandoned, &Self::closed_error());
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
        completion: Completion,
    ) {
        if self.cancel.is_cancelled() {
            completion(Err(Self::closed_error()));
            return;
        }

        let mut in_flight = self.in_flight.lock();
        match self
            .client
            .try_publish(topic, QoS::AtMostOnce, options.retain, payload)
        {
            Ok(()) => in_flight.publishes.push_back(completion),
            Err(e) => {
                drop(in_flight);
                completion(Err(e.into()));
            }
        }
    }

    fn subscribe(&self, topics: Vec<String>, completion: Completion) {
        if self.cancel.is_cancelled() {
            completion(Err(Self::closed_error()));
            return;
        }

        let filters: Vec<SubscribeFilter> = topics
            .into_iter()
            .map(|topic| SubscribeFilter::new(topic, QoS::AtMostOnce))
            .collect();

        let mut in_flight = self.in_flight.lock();
        match self.client.try_subscribe_many(filters) {
            Ok(()) => in_flight.queued_subscribes.push_back(completion),
            Err(e) => {
                drop(in_flight);
                completion(Err(e.into()));
            }
        }
    }

    fn unsubscribe(&self, topics: Vec<String>, completion: Completion) {
        if self.cancel.is_cancelled() {
            completion(Err(Self::closed_error()));
            return;
        }

        // One UNSUBSCRIBE per topic, joined into a single outcome
        let parts = split_completion(completion, topics.len());
        for (topic, part) in topics.into_iter().zip(parts) {
            let mut in_flight = self.in_flight.lock();
            match self.client.try_unsubscribe(topic) {
                Ok(()) => in_flight.queued_unsubscribes.push_back(part),
                Err(e) => {
                    drop(in_flight);
                    part(Err(e.into()));
                }
            }
        }
    }
}

fn is_unreachable(e: &ConnectionError) -> bool {
    use std::io::ErrorKind;

    match e {
        ConnectionError::Io(io) => matches!(
            io.kind(),
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable | ErrorKind::NetworkDown
        ),
        _ => false,
    }
}

/// Translates polled rumqttc events into transport events and request
/// completions. Owned by the event loop task.
struct EventRouter {
    in_flight: SharedInFlight,
    events: EventSink,
    connected_once: bool,
}

impl EventRouter {
    fn new(in_flight: SharedInFlight, events: EventSink) -> Self {
        Self {
            in_flight,
            events,
            connected_once: false,
        }
    }

    /// Handles one event. Returns `false` when the loop should stop.
    fn event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("CONNACK received");
                self.connected_once = true;
                self.events.emit(TransportEvent::Connect);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("PUBLISH received on {}", publish.topic);
                self.events.emit(TransportEvent::message(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                ));
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let completion = self.in_flight.lock().subscribes.remove(&ack.pkid);
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                match completion {
                    Some(completion) if rejected => completion(Err(TransportError::new(
                        "Broker rejected the subscription",
                    ))),
                    Some(completion) => completion(Ok(())),
                    None => debug!("SUBACK for unknown packet id {}", ack.pkid),
                }
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                let completion = self.in_flight.lock().unsubscribes.remove(&ack.pkid);
                match completion {
                    Some(completion) => completion(Ok(())),
                    None => debug!("UNSUBACK for unknown packet id {}", ack.pkid),
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
                self.events.emit(TransportEvent::Close);
            }
            Event::Outgoing(Outgoing::Publish(_)) => {
                let completion = self.in_flight.lock().publishes.pop_front();
                if let Some(completion) = completion {
                    completion(Ok(()));
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let mut guard = self.in_flight.lock();
                if let Some(completion) = guard.queued_subscribes.pop_front() {
                    guard.subscribes.insert(pkid, completion);
                }
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                let mut guard = self.in_flight.lock();
                if let Some(completion) = guard.queued_unsubscribes.pop_front() {
                    guard.unsubscribes.insert(pkid, completion);
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("DISCONNECT sent, stopping event loop");
                self.events.emit(TransportEvent::Close);
                return false;
            }
            event => trace!("Unhandled MQTT event: {:?}", event),
        }
        true
    }

    /// Handles a failed poll. Requests already on the wire are failed since
    /// their acknowledgements will never arrive. Returns whether a
    /// reconnect should be announced before polling again.
    fn connection_error(&mut self, e: ConnectionError) -> bool {
        let offline = is_unreachable(&e);
        let error = TransportError::from(e);
        error!("MQTT connection error: {}", error);

        let lost = self.in_flight.lock().take_sent();
        SharedInFlight::fail(lost, &error);

        self.events.emit(TransportEvent::Error(error));
        self.events.emit(if offline {
            TransportEvent::Offline
        } else {
            TransportEvent::Close
        });
        self.connected_once
    }

    fn announce_reconnect(&self) {
        self.events.emit(TransportEvent::Reconnecting);
    }

    /// Fails everything still waiting once the loop has stopped.
    fn stopped(&self) {
        let abandoned = self.in_flight.lock().take_all();
        SharedInFlight::fail(abandoned, &MqttHandle::closed_error());
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    mut router: EventRouter,
    cancel: CancellationToken,
    reconnect_period: Duration,
) {
    debug!("MQTT event loop started");

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(event) => {
                if !router.event(event) {
                    break;
                }
            }
            Err(e) => {
                let reconnecting = router.connection_error(e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_period) => {}
                }
                // Before the first CONNACK rumqttc simply retries the initial connect
                if reconnecting {
                    router.announce_reconnect();
                }
            }
        }
    }

    cancel.cancel();
    router.stopped();
    debug!("MQTT event loop stopped");
}
