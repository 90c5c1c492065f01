//! MQTT binding of the durable channel.
//!
//! Records travel as QoS 1 messages on `{exchange}/{routing_key}`:
//! - the broker stores each message and confirms it with a PUBACK, which
//!   [`MqttPublisher::publish`](super::MessageSink::publish) waits for
//! - the consumer connects with the queue name as client id and a
//!   persistent session, so the broker buffers messages while it is away
//! - acknowledgements are manual; an unacknowledged message is sent again
//!   when the session resumes
//!
//! MQTT has no negative acknowledgement. A requeue publishes the payload
//! again on the same topic before acknowledging the original, and a
//! dead-letter publishes it on `{topic}/dead-letter` instead.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rumqttc::{
    Client, Connection, Event, MqttOptions, Outgoing, Packet, Publish, QoS, RecvTimeoutError,
};

use super::{dead_letter_topic, topic_for, ChannelError, Delivery, MessageSink, MessageSource, Rejection};
use crate::signal::ShutdownHandler;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// Largest packet accepted or sent.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Smallest keep-alive the client library accepts.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// How often the publisher's driver thread checks for shutdown.
const DRIVER_POLL: Duration = Duration::from_millis(200);

/// Pause before the driver polls again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional user name and password.
    pub credentials: Option<(String, String)>,
    /// Topic namespace.
    pub exchange: String,
    /// Topic below the namespace.
    pub routing_key: String,
    /// Durable consumer identity.
    pub queue: String,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// How long to wait for CONNACK at startup.
    pub connect_timeout: Duration,
    /// How long to wait for PUBACK.
    pub publish_timeout: Duration,
}

impl MqttSettings {
    /// Settings for `host:port` with the default names and timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            exchange: "instruments".to_string(),
            routing_key: "default".to_string(),
            queue: "default-queue".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }

    /// Topic records are published to and consumed from.
    #[must_use]
    pub fn topic(&self) -> String {
        topic_for(&self.exchange, &self.routing_key)
    }

    /// Build client options for `client_id`.
    #[must_use]
    pub fn options(&self, client_id: &str, clean_session: bool) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(clean_session);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

/// Events forwarded from the publisher's connection to `publish` callers.
#[derive(Debug)]
enum DriverEvent {
    Connected,
    Sent(u16),
    Acked(u16),
    Failed(String),
}

/// Matches driver events to the most recent publish request.
///
/// Requests are serialized and the client sends them in order, so the n-th
/// first transmission belongs to the n-th request. A late transmission or
/// PUBACK of an earlier, timed-out request is counted but never confirms a
/// later one.
#[derive(Debug, Default)]
struct AckTracker {
    requested: u64,
    sent: u64,
    awaiting: Option<u16>,
}

impl AckTracker {
    /// Note a request handed to the client.
    fn request(&mut self) {
        self.requested += 1;
        self.awaiting = None;
    }

    /// Feed one driver event; `true` when it confirms the latest request.
    fn observe(&mut self, event: &DriverEvent) -> bool {
        match *event {
            DriverEvent::Sent(pkid) => {
                self.sent += 1;
                if self.sent == self.requested {
                    self.awaiting = Some(pkid);
                }
                false
            }
            DriverEvent::Acked(pkid) => self.awaiting == Some(pkid),
            DriverEvent::Connected | DriverEvent::Failed(_) => false,
        }
    }
}

struct PublishSide {
    client: Client,
    events: Receiver<DriverEvent>,
    tracker: AckTracker,
}

/// Publishing half of the MQTT channel.
///
/// A background thread drives the connection and reports packet
/// identifiers; publishes are serialized so each caller can match its own
/// PUBACK.
pub struct MqttPublisher {
    topic: String,
    publish_timeout: Duration,
    side: Mutex<PublishSide>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MqttPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("topic", &self.topic)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl MqttPublisher {
    /// Connect to the broker and wait for CONNACK.
    ///
    /// # Arguments
    ///
    /// * `settings` - Broker address, topic and timeouts
    /// * `shutdown` - Stops the connection driver when requested
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] or [`ChannelError::Timeout`] if the
    /// broker does not accept the connection within `connect_timeout`.
    pub fn connect(settings: &MqttSettings, shutdown: ShutdownHandler) -> Result<Self, ChannelError> {
        let client_id = format!("{}-publisher-{}", settings.queue, std::process::id());
        let (client, connection) = Client::new(settings.options(&client_id, true), REQUEST_CAPACITY);
        let (tx, events) = mpsc::channel();

        let driver = thread::Builder::new()
            .name("mqtt-publisher".to_string())
            .spawn(move || drive(connection, &tx, &shutdown))
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let deadline = Instant::now() + settings.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(DriverEvent::Connected) => break,
                Ok(DriverEvent::Failed(reason)) => return Err(ChannelError::Connect(reason)),
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(ChannelError::Timeout {
                        operation: "CONNACK",
                        after: settings.connect_timeout,
                    })
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }

        log::info!(
            "Connected to MQTT broker {}:{} as {}",
            settings.host,
            settings.port,
            client_id
        );

        Ok(Self {
            topic: settings.topic(),
            publish_timeout: settings.publish_timeout,
            side: Mutex::new(PublishSide {
                client,
                events,
                tracker: AckTracker::default(),
            }),
            driver: Some(driver),
        })
    }

    /// Topic this publisher sends to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Disconnect and wait for the driver thread to finish.
    pub fn close(mut self) {
        if let Ok(side) = self.side.lock() {
            if let Err(e) = side.client.disconnect() {
                log::debug!("MQTT disconnect failed: {}", e);
            }
        }
        if let Some(driver) = self.driver.take() {
            if driver.join().is_err() {
                log::error!("MQTT publisher driver panicked");
            }
        }
    }
}

/// Poll the connection until shutdown or until nobody listens any more.
fn drive(mut connection: Connection, events: &Sender<DriverEvent>, shutdown: &ShutdownHandler) {
    let mut in_flight = HashSet::new();
    while !shutdown.is_shutdown_requested() {
        let event = match connection.recv_timeout(DRIVER_POLL) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => DriverEvent::Connected,
            Ok(Ok(Event::Incoming(Packet::PubAck(ack)))) => {
                in_flight.remove(&ack.pkid);
                DriverEvent::Acked(ack.pkid)
            }
            // Retransmissions after a reconnect are not new requests.
            Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) if !in_flight.insert(pkid) => continue,
            Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => DriverEvent::Sent(pkid),
            Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => break,
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => {
                log::warn!("MQTT connection error: {}", e);
                if events.send(DriverEvent::Failed(e.to_string())).is_err() {
                    break;
                }
                shutdown.wait_timeout(RECONNECT_DELAY);
                continue;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    log::debug!("MQTT publisher driver stopped");
}

impl MessageSink for MqttPublisher {
    fn publish(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let mut guard = self
            .side
            .lock()
            .map_err(|_| ChannelError::Publish("publisher lock poisoned".to_string()))?;
        let side = &mut *guard;

        // Events left over from an earlier timed-out publish.
        while let Ok(event) = side.events.try_recv() {
            side.tracker.observe(&event);
        }

        side.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        side.tracker.request();

        let deadline = Instant::now() + self.publish_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout {
                    operation: "PUBACK",
                    after: self.publish_timeout,
                });
            }
            match side.events.recv_timeout(remaining) {
                Ok(event) if side.tracker.observe(&event) => return Ok(()),
                Ok(DriverEvent::Failed(reason)) => return Err(ChannelError::Publish(reason)),
                Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }
    }
}

/// Consuming half of the MQTT channel.
pub struct MqttSubscription {
    client: Client,
    connection: Connection,
    topic: String,
    dead_letter_topic: String,
    pending: HashMap<u64, Publish>,
    next_tag: u64,
}

impl std::fmt::Debug for MqttSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSubscription")
            .field("topic", &self.topic)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl MqttSubscription {
    /// Open the durable session for `settings.queue` and subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] or [`ChannelError::Timeout`] if the
    /// broker does not accept the connection within `connect_timeout`.
    pub fn connect(settings: &MqttSettings) -> Result<Self, ChannelError> {
        let mut options = settings.options(&settings.queue, false);
        options.set_manual_acks(true);

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        let topic = settings.topic();
        client
            .subscribe(topic.as_str(), QoS::AtLeastOnce)
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let deadline = Instant::now() + settings.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(ChannelError::Connect(e.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ChannelError::Timeout {
                        operation: "CONNACK",
                        after: settings.connect_timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }

        log::info!(
            "Subscribed to {} on {}:{} as {}",
            topic,
            settings.host,
            settings.port,
            settings.queue
        );

        Ok(Self {
            client,
            connection,
            dead_letter_topic: dead_letter_topic(&topic),
            topic,
            pending: HashMap::new(),
            next_tag: 0,
        })
    }

    /// Disconnect, flushing outstanding acknowledgements first.
    pub fn close(mut self) {
        if let Err(e) = self.client.disconnect() {
            log::debug!("MQTT disconnect failed: {}", e);
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            match self.connection.recv_timeout(DRIVER_POLL) {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => {}
            }
        }
    }

    fn take_pending(&mut self, tag: u64) -> Result<Publish, ChannelError> {
        self.pending
            .remove(&tag)
            .ok_or(ChannelError::UnknownDelivery(tag))
    }

    fn settle(&mut self, publish: &Publish) -> Result<(), ChannelError> {
        self.client
            .ack(publish)
            .map_err(|e| ChannelError::Ack(e.to_string()))
    }
}

impl MessageSource for MqttSubscription {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    if publish.topic != self.topic {
                        log::debug!("Ignoring message on {}", publish.topic);
                        self.settle(&publish)?;
                        continue;
                    }
                    self.next_tag += 1;
                    let delivery = Delivery {
                        tag: self.next_tag,
                        payload: publish.payload.to_vec(),
                        redelivered: publish.dup,
                    };
                    self.pending.insert(delivery.tag, publish);
                    return Ok(Some(delivery));
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    log::info!("Reconnected to MQTT broker");
                }
                Ok(Ok(Event::Incoming(Packet::SubAck(_)))) => {
                    log::debug!("Subscription to {} acknowledged", self.topic);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    // The broker resends unacknowledged messages on the next session.
                    self.pending.clear();
                    return Err(ChannelError::Connect(e.to_string()));
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        let publish = self.take_pending(delivery.tag)?;
        self.settle(&publish)
    }

    fn reject(&mut self, delivery: &Delivery, rejection: Rejection) -> Result<(), ChannelError> {
        let publish = self.take_pending(delivery.tag)?;
        let destination = match rejection {
            Rejection::Requeue => self.topic.clone(),
            Rejection::DeadLetter => self.dead_letter_topic.clone(),
        };
        self.client
            .publish(destination, QoS::AtLeastOnce, false, publish.payload.to_vec())
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        self.settle(&publish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_settings_topic_and_options() {
        let mut settings = MqttSettings::new("broker.local", 1884);
        settings.routing_key = "lab-3".to_string();
        settings.keep_alive = Duration::from_secs(1);
        settings.credentials = Some(("user".to_string(), "secret".to_string()));

        assert_eq!(settings.topic(), "instruments/lab-3");

        let options = settings.options("client-a", false);
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "client-a");
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_late_ack_does_not_confirm_next_publish() {
        let mut tracker = AckTracker::default();

        // First request times out before the driver reports anything.
        tracker.request();
        tracker.request();

        assert!(!tracker.observe(&DriverEvent::Sent(1)));
        assert!(!tracker.observe(&DriverEvent::Sent(2)));
        assert!(!tracker.observe(&DriverEvent::Acked(1)));
        assert!(tracker.observe(&DriverEvent::Acked(2)));
    }

    #[test]
    fn test_drained_events_count_toward_order() {
        let mut tracker = AckTracker::default();
        tracker.request();

        // Leftovers of the timed-out request, drained before the next one.
        assert!(!tracker.observe(&DriverEvent::Sent(7)));
        assert!(!tracker.observe(&DriverEvent::Failed("reset".to_string())));

        tracker.request();
        assert!(!tracker.observe(&DriverEvent::Acked(7)));
        assert!(!tracker.observe(&DriverEvent::Connected));
        assert!(!tracker.observe(&DriverEvent::Sent(8)));
        assert!(tracker.observe(&DriverEvent::Acked(8)));
    }

    #[test]
    fn test_publisher_connect_fails_without_broker() {
        let mut settings = MqttSettings::new("127.0.0.1", unused_port());
        settings.connect_timeout = Duration::from_secs(3);

        let shutdown = ShutdownHandler::new();
        let result = MqttPublisher::connect(&settings, shutdown.clone());
        shutdown.request_shutdown();

        assert!(matches!(
            result,
            Err(ChannelError::Connect(_) | ChannelError::Timeout { .. })
        ));
    }

    #[test]
    fn test_subscription_connect_fails_without_broker() {
        let mut settings = MqttSettings::new("127.0.0.1", unused_port());
        settings.connect_timeout = Duration::from_secs(3);

        assert!(matches!(
            MqttSubscription::connect(&settings),
            Err(ChannelError::Connect(_) | ChannelError::Timeout { .. })
        ));
    }
}
