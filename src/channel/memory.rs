//! In-process durable broker.
//!
//! [`MemoryBroker`] models one durable queue: published messages wait in
//! the ready list, a delivery moves a message to the unacknowledged set,
//! and only an ack removes it for good. [`MemoryBroker::recover`] plays
//! the part of a consumer crash by returning every unacknowledged message
//! to the front of the queue flagged as redelivered.
//!
//! Clones share the same queue, so one clone can publish while another
//! consumes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ChannelError, Delivery, MessageSink, MessageSource, Rejection};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    dead_letters: Vec<Vec<u8>>,
    next_tag: u64,
    published: u64,
    failing_publishes: usize,
    closed: bool,
}

/// Shared in-memory durable queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<(Mutex<BrokerState>, Condvar)>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state().failing_publishes = count;
    }

    /// Return all unacknowledged messages to the head of the queue, in
    /// delivery order, flagged as redelivered.
    ///
    /// # Returns
    ///
    /// The number of messages recovered.
    pub fn recover(&self) -> usize {
        let mut state = self.state();
        let unacked = std::mem::take(&mut state.unacked);
        let count = unacked.len();
        for (_, mut message) in unacked.into_iter().rev() {
            message.redelivered = true;
            state.ready.push_front(message);
        }
        drop(state);
        self.inner.1.notify_all();
        count
    }

    /// Close the broker; sources report [`ChannelError::Closed`] once the
    /// ready list is drained.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.1.notify_all();
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages delivered but neither acknowledged nor rejected.
    #[must_use]
    pub fn unacked_len(&self) -> usize {
        self.state().unacked.len()
    }

    /// Total successful publishes.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.state().published
    }

    /// Payloads moved to the dead-letter list.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state().dead_letters.clone()
    }

    fn take_unacked(&self, tag: u64) -> Result<Message, ChannelError> {
        self.state()
            .unacked
            .remove(&tag)
            .ok_or(ChannelError::UnknownDelivery(tag))
    }
}

impl MessageSink for MemoryBroker {
    fn publish(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.state();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(ChannelError::Publish("injected failure".to_string()));
        }
        state.ready.push_back(Message {
            payload: payload.to_vec(),
            redelivered: false,
        });
        state.published += 1;
        drop(state);
        self.inner.1.notify_one();
        Ok(())
    }
}

impl MessageSource for MemoryBroker {
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let (lock, ready) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if let Some(message) = state.ready.pop_front() {
                state.next_tag += 1;
                let tag = state.next_tag;
                let delivery = Delivery {
                    tag,
                    payload: message.payload.clone(),
                    redelivered: message.redelivered,
                };
                state.unacked.insert(tag, message);
                return Ok(Some(delivery));
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.take_unacked(delivery.tag).map(|_| ())
    }

    fn reject(&mut self, delivery: &Delivery, rejection: Rejection) -> Result<(), ChannelError> {
        let mut message = self.take_unacked(delivery.tag)?;
        let mut state = self.state();
        match rejection {
            Rejection::Requeue => {
                message.redelivered = true;
                state.ready.push_back(message);
                drop(state);
                self.inner.1.notify_one();
            }
            Rejection::DeadLetter => state.dead_letters.push(message.payload),
        }
        Ok(())
    }
}
