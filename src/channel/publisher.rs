//! Publish side of the durable channel.

use std::sync::atomic::{AtomicU64, Ordering};

use bytesize::ByteSize;

use super::{ChannelError, MessageSink};
use crate::record::StatusRecord;

/// Publishes status records through a [`MessageSink`].
///
/// One publish per record, no batching. A failed publish is returned to
/// the caller unchanged so the file that produced the record is retried.
#[derive(Debug)]
pub struct RecordPublisher<S> {
    sink: S,
    published: AtomicU64,
    failed: AtomicU64,
}

impl<S: MessageSink> RecordPublisher<S> {
    /// Wrap `sink`.
    #[must_use]
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Serialize and publish `record`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Serialize`] or the sink's failure.
    pub fn publish_record(&self, record: &StatusRecord) -> Result<(), ChannelError> {
        let payload = record.to_wire()?;
        self.publish_payload(&payload)
    }

    /// Publish an already serialized record.
    ///
    /// # Errors
    ///
    /// Returns the sink's failure.
    pub fn publish_payload(&self, payload: &[u8]) -> Result<(), ChannelError> {
        match self.sink.publish(payload) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                log::debug!("Published record ({})", ByteSize(payload.len() as u64));
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Number of confirmed publishes.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of failed publishes.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// The underlying sink.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Consume the publisher, returning the sink.
    #[must_use]
    pub fn into_sink(self) -> S {
        self.sink
    }
}
