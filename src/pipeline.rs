//! Process wiring.
//!
//! Two pipelines share the record model and the durable channel:
//!
//! - **watch**: [`DirectoryPoller`] → [`RecordProducer`] → [`RecordPublisher`]
//! - **consume**: [`Consumer`] → [`ModuleStateStore`]
//!
//! A file's fingerprint is committed only after its record has been
//! confirmed by the broker, and a delivery is acknowledged only after its
//! record has been committed to the store. Either side can therefore crash
//! at any point without losing an update.

use std::path::Path;

use crate::channel::{
    ChannelError, Consumer, ConsumerStats, MessageSink, MessageSource, RecordPublisher,
};
use crate::record::{Enrich, FragmentEnricher, ProduceError, RecordProducer, StatusRecord};
use crate::scanner::{DirectoryPoller, PollerStats};
use crate::store::{ModuleStateStore, StoreError};

/// Failure to relay one snapshot file; the file is retried next tick.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// The record could not be produced.
    #[error(transparent)]
    Produce(#[from] ProduceError),

    /// The broker did not confirm the record.
    #[error("Failed to publish record: {0}")]
    Publish(#[from] ChannelError),
}

/// Produces and publishes the record for one snapshot file.
#[derive(Debug)]
pub struct FileRelay<S, E = FragmentEnricher> {
    producer: RecordProducer<E>,
    publisher: RecordPublisher<S>,
}

impl<S: MessageSink, E: Enrich> FileRelay<S, E> {
    /// Combine a producer and a publisher.
    #[must_use]
    pub fn new(producer: RecordProducer<E>, publisher: RecordPublisher<S>) -> Self {
        Self {
            producer,
            publisher,
        }
    }

    /// The publisher, for counters.
    #[must_use]
    pub fn publisher(&self) -> &RecordPublisher<S> {
        &self.publisher
    }

    /// Consume the relay, returning its publisher.
    #[must_use]
    pub fn into_publisher(self) -> RecordPublisher<S> {
        self.publisher
    }

    /// Relay the snapshot at `path`.
    ///
    /// # Returns
    ///
    /// `true` if a record was published, `false` if the file produced none.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if production or publishing failed.
    pub fn relay(&self, path: &Path) -> Result<bool, RelayError> {
        let Some(produced) = self.producer.produce(path)? else {
            return Ok(false);
        };

        self.publisher.publish_payload(&produced.payload)?;
        log::debug!(
            "Relayed {} ({} modules)",
            path.display(),
            produced.record.modules.len()
        );
        Ok(true)
    }
}

/// Totals for a watch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Poller totals.
    pub poller: PollerStats,
    /// Records confirmed by the broker.
    pub published: u64,
    /// Publishes that failed.
    pub publish_failures: u64,
}

/// Run the watch pipeline until shutdown.
pub fn run_watch<S, E>(poller: &DirectoryPoller, relay: &FileRelay<S, E>) -> WatchStats
where
    S: MessageSink,
    E: Enrich,
{
    let poller_stats = poller.run(|path: &Path| relay.relay(path).map(|_| ()));

    let stats = WatchStats {
        poller: poller_stats,
        published: relay.publisher().published(),
        publish_failures: relay.publisher().failed(),
    };
    log::info!(
        "Watch finished: {} ticks, {} records published, {} failed publishes",
        stats.poller.ticks,
        stats.published,
        stats.publish_failures
    );
    stats
}

/// Apply one received record to the store.
///
/// # Errors
///
/// Returns the store failure so the delivery is requeued.
pub fn apply_record(store: &ModuleStateStore, record: &StatusRecord) -> Result<(), StoreError> {
    let summary = store.apply(record)?;
    log::debug!(
        "Applied record {}: {} created, {} updated, {} unchanged",
        record.package_id.as_deref().unwrap_or("-"),
        summary.created,
        summary.updated,
        summary.unchanged
    );
    Ok(())
}

/// Run the consume pipeline until shutdown or until the channel closes.
pub fn run_consume<S: MessageSource>(
    consumer: &mut Consumer<S>,
    store: &ModuleStateStore,
) -> ConsumerStats {
    consumer.run(|record: &StatusRecord| apply_record(store, record))
}
