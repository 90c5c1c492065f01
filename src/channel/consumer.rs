//! Subscribe side of the durable channel.
//!
//! The [`Consumer`] receives deliveries one at a time and settles each one:
//!
//! | Result of the delivery | Settlement |
//! |---|---|
//! | decoded and applied | ack |
//! | undecodable or apply failed, below the delivery limit | requeue after a delay |
//! | undecodable or apply failed, limit reached | dead-letter |
//!
//! Failures are counted per payload digest, so a message keeps its count
//! across requeues even though the broker hands it out under a new tag.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use super::{ChannelError, Delivery, MessageSource, Rejection};
use crate::record::StatusRecord;
use crate::scanner::{Hash, Hasher};
use crate::signal::ShutdownHandler;

/// Default number of failed deliveries before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERIES: u32 = 10;

/// Default wait before a failed delivery is requeued.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// How long one receive wait lasts before shutdown is checked again.
pub const RECEIVE_POLL: Duration = Duration::from_millis(250);

/// Retry policy for deliveries that cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Failed deliveries allowed before dead-lettering. Zero requeues forever.
    pub max_deliveries: u32,
    /// Pause before a failed delivery is requeued.
    pub requeue_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

impl RedeliveryPolicy {
    /// Policy that never dead-letters and requeues immediately.
    #[must_use]
    pub fn requeue_forever() -> Self {
        Self {
            max_deliveries: 0,
            requeue_delay: Duration::ZERO,
        }
    }

    /// Whether a message that has failed `failures` times is dead.
    #[must_use]
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_deliveries > 0 && failures >= self.max_deliveries
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Applied and acknowledged.
    Acked,
    /// Failed and handed back for another attempt.
    Requeued,
    /// Failed too often and moved to the dead-letter destination.
    DeadLettered,
}

/// Counters for one consume run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries received.
    pub received: u64,
    /// Deliveries applied and acknowledged.
    pub acked: u64,
    /// Deliveries requeued.
    pub requeued: u64,
    /// Deliveries dead-lettered.
    pub dead_lettered: u64,
    /// Receive or settlement errors from the source.
    pub channel_errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Acked => self.acked += 1,
            DeliveryOutcome::Requeued => self.requeued += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// At-least-once consumer over a [`MessageSource`].
pub struct Consumer<S> {
    source: S,
    policy: RedeliveryPolicy,
    shutdown: ShutdownHandler,
    failures: HashMap<Hash, u32>,
    hasher: Hasher,
}

impl<S: MessageSource> Consumer<S> {
    /// Create a consumer reading from `source`.
    #[must_use]
    pub fn new(source: S, policy: RedeliveryPolicy, shutdown: ShutdownHandler) -> Self {
        Self {
            source,
            policy,
            shutdown,
            failures: HashMap::new(),
            hasher: Hasher::new(),
        }
    }

    /// The redelivery policy in use.
    #[must_use]
    pub fn policy(&self) -> RedeliveryPolicy {
        self.policy
    }

    /// Consume the consumer, returning the source.
    #[must_use]
    pub fn into_source(self) -> S {
        self.source
    }

    /// Consume until shutdown is requested or the source closes.
    ///
    /// `apply` is never interrupted: shutdown only stops further receives.
    /// Transient source errors are logged and the loop continues.
    ///
    /// # Arguments
    ///
    /// * `apply` - Applies one decoded record; an error requeues the message
    ///
    /// # Returns
    ///
    /// Counters for the run.
    pub fn run<F, E>(&mut self, mut apply: F) -> ConsumerStats
    where
        F: FnMut(&StatusRecord) -> Result<(), E>,
        E: Display,
    {
        let mut stats = ConsumerStats::default();
        log::info!("Consumer started");

        while !self.shutdown.is_shutdown_requested() {
            match self.receive_and_settle(RECEIVE_POLL, &mut apply, &mut stats) {
                Ok(_) => {}
                Err(ChannelError::Closed) => {
                    log::info!("Channel closed");
                    break;
                }
                Err(e) => {
                    stats.channel_errors += 1;
                    log::error!("Channel error: {}", e);
                    self.shutdown.wait_timeout(RECEIVE_POLL);
                }
            }
        }

        log::info!(
            "Consumer stopped: {} received, {} acked, {} requeued, {} dead-lettered",
            stats.received,
            stats.acked,
            stats.requeued,
            stats.dead_lettered
        );
        stats
    }

    /// Receive and settle at most one delivery.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if nothing arrived within `timeout`.
    ///
    /// # Errors
    ///
    /// Source failures while receiving or settling.
    pub fn process_next<F, E>(
        &mut self,
        timeout: Duration,
        apply: &mut F,
    ) -> Result<Option<DeliveryOutcome>, ChannelError>
    where
        F: FnMut(&StatusRecord) -> Result<(), E>,
        E: Display,
    {
        let mut stats = ConsumerStats::default();
        self.receive_and_settle(timeout, apply, &mut stats)
    }

    fn receive_and_settle<F, E>(
        &mut self,
        timeout: Duration,
        apply: &mut F,
        stats: &mut ConsumerStats,
    ) -> Result<Option<DeliveryOutcome>, ChannelError>
    where
        F: FnMut(&StatusRecord) -> Result<(), E>,
        E: Display,
    {
        let Some(delivery) = self.source.next_delivery(timeout)? else {
            return Ok(None);
        };
        stats.received += 1;

        let outcome = self.settle(&delivery, apply)?;
        stats.record(outcome);
        Ok(Some(outcome))
    }

    /// Decode, apply and settle one delivery.
    fn settle<F, E>(&mut self, delivery: &Delivery, apply: &mut F) -> Result<DeliveryOutcome, ChannelError>
    where
        F: FnMut(&StatusRecord) -> Result<(), E>,
        E: Display,
    {
        let failure = match StatusRecord::from_wire(&delivery.payload) {
            Ok(record) => {
                log::debug!(
                    "Received record with {} modules{}",
                    record.modules.len(),
                    if delivery.redelivered { " (redelivered)" } else { "" }
                );
                match apply(&record) {
                    Ok(()) => None,
                    Err(e) => Some(format!("apply failed: {e}")),
                }
            }
            Err(e) => Some(format!("undecodable payload: {e}")),
        };

        let digest = self.hasher.hash_bytes(&delivery.payload);

        let Some(reason) = failure else {
            self.source.ack(delivery)?;
            self.failures.remove(&digest);
            return Ok(DeliveryOutcome::Acked);
        };

        let failures = self.failures.entry(digest).or_insert(0);
        *failures += 1;
        let attempts = *failures;

        if self.policy.is_exhausted(attempts) {
            self.failures.remove(&digest);
            log::error!(
                "Dead-lettering message after {} failed deliveries: {}",
                attempts,
                reason
            );
            self.source.reject(delivery, Rejection::DeadLetter)?;
            return Ok(DeliveryOutcome::DeadLettered);
        }

        log::warn!("Requeueing message (attempt {}): {}", attempts, reason);
        if !self.policy.requeue_delay.is_zero() {
            self.shutdown.wait_timeout(self.policy.requeue_delay);
        }
        self.source.reject(delivery, Rejection::Requeue)?;
        Ok(DeliveryOutcome::Requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryBroker, MessageSink};
    use crate::record::{ModuleEntry, ModuleState};

    const WAIT: Duration = Duration::from_millis(10);

    fn payload(state: ModuleState) -> Vec<u8> {
        StatusRecord::new(None, vec![ModuleEntry::new("M1", state)])
            .to_wire()
            .unwrap()
    }

    fn fast_policy(max_deliveries: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_deliveries,
            requeue_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_success_acks() {
        let broker = MemoryBroker::new();
        broker.publish(&payload(ModuleState::Run)).unwrap();

        let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
        let mut seen = Vec::new();
        let outcome = consumer
            .process_next(WAIT, &mut |r: &StatusRecord| -> Result<(), String> {
                seen.push(r.modules[0].state);
                Ok(())
            })
            .unwrap();

        assert_eq!(outcome, Some(DeliveryOutcome::Acked));
        assert_eq!(seen, vec![ModuleState::Run]);
        assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
    }

    #[test]
    fn test_failure_requeues_then_succeeds() {
        let broker = MemoryBroker::new();
        broker.publish(&payload(ModuleState::Offline)).unwrap();

        let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
        let mut calls = 0;
        let mut flaky = |_: &StatusRecord| -> Result<(), String> {
            calls += 1;
            if calls == 1 {
                Err("store busy".to_string())
            } else {
                Ok(())
            }
        };

        assert_eq!(
            consumer.process_next(WAIT, &mut flaky).unwrap(),
            Some(DeliveryOutcome::Requeued)
        );
        assert_eq!(
            consumer.process_next(WAIT, &mut flaky).unwrap(),
            Some(DeliveryOutcome::Acked)
        );
        assert!(consumer.failures.is_empty());
    }

    #[test]
    fn test_poison_message_is_dead_lettered() {
        let broker = MemoryBroker::new();
        broker.publish(b"not a record").unwrap();

        let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
        let mut never = |_: &StatusRecord| -> Result<(), String> { Ok(()) };

        let outcomes: Vec<_> = (0..3)
            .map(|_| consumer.process_next(WAIT, &mut never).unwrap())
            .collect();

        assert_eq!(
            outcomes,
            vec![
                Some(DeliveryOutcome::Requeued),
                Some(DeliveryOutcome::Requeued),
                Some(DeliveryOutcome::DeadLettered)
            ]
        );
        assert_eq!(broker.dead_letters(), vec![b"not a record".to_vec()]);
        assert_eq!(consumer.process_next(WAIT, &mut never).unwrap(), None);
    }

    #[test]
    fn test_zero_limit_requeues_forever() {
        let broker = MemoryBroker::new();
        broker.publish(b"garbage").unwrap();

        let mut consumer =
            Consumer::new(broker.clone(), RedeliveryPolicy::requeue_forever(), ShutdownHandler::new());
        let mut apply = |_: &StatusRecord| -> Result<(), String> { Ok(()) };

        for _ in 0..25 {
            assert_eq!(
                consumer.process_next(WAIT, &mut apply).unwrap(),
                Some(DeliveryOutcome::Requeued)
            );
        }
        assert!(broker.dead_letters().is_empty());
    }

    #[test]
    fn test_run_stops_on_shutdown_and_close() {
        let broker = MemoryBroker::new();
        broker.publish(&payload(ModuleState::Run)).unwrap();
        broker.publish(&payload(ModuleState::NotReady)).unwrap();
        broker.close();

        let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
        let stats = consumer.run(|_: &StatusRecord| -> Result<(), String> { Ok(()) });
        assert_eq!(stats.received, 2);
        assert_eq!(stats.acked, 2);

        let shutdown = ShutdownHandler::new();
        shutdown.request_shutdown();
        let mut consumer = Consumer::new(MemoryBroker::new(), fast_policy(3), shutdown);
        let stats = consumer.run(|_: &StatusRecord| -> Result<(), String> { Ok(()) });
        assert_eq!(stats, ConsumerStats::default());
    }

    #[test]
    fn test_shutdown_during_apply_finishes_delivery() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = crate::store::ModuleStateStore::open(dir.path().join("state.db")).unwrap();

        let broker = MemoryBroker::new();
        broker.publish(&payload(ModuleState::Run)).unwrap();
        broker.publish(&payload(ModuleState::Offline)).unwrap();

        let shutdown = ShutdownHandler::new();
        let mut consumer = Consumer::new(broker.clone(), fast_policy(3), shutdown.clone());
        let stats = consumer.run(|record: &StatusRecord| {
            shutdown.request_shutdown();
            store.apply(record).map(|_| ())
        });

        assert_eq!(stats.received, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(store.get("M1").unwrap(), Some(ModuleState::Run));
        assert_eq!(broker.recover(), 0);
        assert_eq!(broker.unacked_len(), 0);
        // Only the second message, never received, is still waiting.
        assert_eq!(broker.ready_len(), 1);
    }

    #[test]
    fn test_policy_exhaustion() {
        let policy = fast_policy(2);
        assert!(!policy.is_exhausted(1));
        assert!(policy.is_exhausted(2));
        assert!(!RedeliveryPolicy::requeue_forever().is_exhausted(u32::MAX));
    }
}
