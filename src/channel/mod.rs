//! Durable message channel between the watch and consume processes.
//!
//! The channel is described by two broker-neutral traits:
//! - [`MessageSink`]: publish a payload and return once the broker has
//!   taken responsibility for it
//! - [`MessageSource`]: receive deliveries that stay owned by the consumer
//!   until they are acknowledged or rejected
//!
//! On top of these sit the [`RecordPublisher`] (publish side) and the
//! [`Consumer`] (subscribe side, at-least-once with a bounded redelivery
//! policy). Two bindings are provided: [`mqtt`] for a real broker and
//! [`memory`] for tests and embedding.
//!
//! # Example
//!
//! ```
//! use statusrelay::channel::{Consumer, MemoryBroker, RecordPublisher, RedeliveryPolicy};
//! use statusrelay::record::{ModuleEntry, ModuleState, StatusRecord};
//! use statusrelay::signal::ShutdownHandler;
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//! let publisher = RecordPublisher::new(broker.clone());
//!
//! let record = StatusRecord::new(None, vec![ModuleEntry::new("M1", ModuleState::Run)]);
//! publisher.publish_record(&record).unwrap();
//!
//! let mut consumer = Consumer::new(broker.clone(), RedeliveryPolicy::default(), ShutdownHandler::new());
//! let outcome = consumer
//!     .process_next(Duration::from_millis(10), &mut |r: &StatusRecord| -> Result<(), String> {
//!         assert_eq!(r.modules[0].state, ModuleState::Run);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert!(outcome.is_some());
//! assert_eq!(broker.ready_len(), 0);
//! ```

pub mod consumer;
pub mod memory;
pub mod mqtt;
pub mod publisher;

use std::time::Duration;

pub use consumer::{Consumer, ConsumerStats, DeliveryOutcome, RedeliveryPolicy};
pub use memory::MemoryBroker;
pub use mqtt::{MqttPublisher, MqttSettings, MqttSubscription};
pub use publisher::RecordPublisher;

/// Suffix appended to a topic to form its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

/// Errors raised by channel bindings.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// The broker could not be reached or refused the connection.
    #[error("Broker connection failed: {0}")]
    Connect(String),

    /// A publish was rejected or lost.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// The broker did not answer in time.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: &'static str,
        /// How long we waited
        after: Duration,
    },

    /// The delivery tag is not outstanding on this source.
    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),

    /// The channel has been shut down.
    #[error("Channel closed")]
    Closed,

    /// A record could not be serialized for publishing.
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A message handed to a consumer, owned by it until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Source-local identifier used for ack/reject.
    pub tag: u64,
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

/// How a delivery that could not be applied is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Return the message to the queue for another attempt.
    Requeue,
    /// Move the message to the dead-letter destination.
    DeadLetter,
}

/// Publish side of a durable channel.
pub trait MessageSink: Send + Sync {
    /// Publish `payload` as a persistent message.
    ///
    /// Returns only after the broker confirmed receipt.
    ///
    /// # Errors
    ///
    /// Any broker-level failure, so that the caller can retry later.
    fn publish(&self, payload: &[u8]) -> Result<(), ChannelError>;
}

/// Subscribe side of a durable channel with manual acknowledgement.
pub trait MessageSource {
    /// Wait up to `timeout` for the next delivery.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] once the source can produce no more
    /// deliveries, other variants for transient broker failures.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError>;

    /// Permanently remove `delivery` from the channel.
    ///
    /// # Errors
    ///
    /// Fails if the tag is unknown or the broker rejected the ack.
    fn ack(&mut self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Hand `delivery` back according to `rejection`.
    ///
    /// # Errors
    ///
    /// Fails if the tag is unknown or the broker rejected the operation.
    fn reject(&mut self, delivery: &Delivery, rejection: Rejection) -> Result<(), ChannelError>;
}

impl<T: MessageSink + ?Sized> MessageSink for std::sync::Arc<T> {
    fn publish(&self, payload: &[u8]) -> Result<(), ChannelError> {
        (**self).publish(payload)
    }
}

/// Topic that records for `routing_key` are published to.
#[must_use]
pub fn topic_for(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}/{routing_key}")
}

/// Dead-letter topic for `topic`.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}/{DEAD_LETTER_SUFFIX}")
}
