//! Record production: snapshot file in, serialized record out.

use std::path::Path;

use super::snapshot::parse_snapshot_file;
use super::{Enrich, FragmentEnricher, ProduceError, StatusRecord};

/// A record ready for publishing together with its wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    /// The enriched record.
    pub record: StatusRecord,
    /// JSON wire form of `record`.
    pub payload: Vec<u8>,
}

/// Turns snapshot files into zero or one enriched [`StatusRecord`].
///
/// Production is all-or-nothing per file: either every module entry is
/// enriched and the record serialized, or nothing is produced.
#[derive(Debug, Clone, Default)]
pub struct RecordProducer<E = FragmentEnricher> {
    enricher: E,
}

impl RecordProducer<FragmentEnricher> {
    /// Create a producer using the default [`FragmentEnricher`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_enricher(FragmentEnricher)
    }
}

impl<E: Enrich> RecordProducer<E> {
    /// Create a producer with a custom enrichment step.
    #[must_use]
    pub fn with_enricher(enricher: E) -> Self {
        Self { enricher }
    }

    /// Produce the record for the snapshot at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Snapshot file detected as new or changed
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the file cannot be read or parsed. The failure is
    /// logged and not reported to the caller, so the file is not retried
    /// until it changes again. `Ok(Some(_))` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError`] if enrichment of any module fails or the
    /// record cannot be serialized. The caller should retry the file.
    pub fn produce(&self, path: &Path) -> Result<Option<ProducedRecord>, ProduceError> {
        let parsed = match parse_snapshot_file(path) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Skipping {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let record = self.enrich(parsed)?;
        let payload = record.to_wire()?;

        log::debug!(
            "Produced record from {} ({} modules, {} bytes)",
            path.display(),
            record.modules.len(),
            payload.len()
        );

        Ok(Some(ProducedRecord { record, payload }))
    }

    /// Apply the enrichment step to every module of `record`.
    ///
    /// # Errors
    ///
    /// Returns the first enrichment failure; the record is then discarded.
    pub fn enrich(&self, record: StatusRecord) -> Result<StatusRecord, ProduceError> {
        let modules = record
            .modules
            .into_iter()
            .map(|entry| self.enricher.enrich(entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StatusRecord {
            package_id: record.package_id,
            modules,
        })
    }
}
