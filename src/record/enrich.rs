//! Module-state enrichment.
//!
//! Enrichment runs on every module entry of a freshly parsed record before
//! it is published. It is injected into the [`RecordProducer`](super::RecordProducer)
//! so tests and deployments can swap the business rule without touching the
//! pipeline. Any `Fn(ModuleEntry) -> Result<ModuleEntry, EnrichError>`
//! closure works as an enricher.

use super::fragment::read_module_state;
use super::{EnrichError, ModuleEntry};

/// Computes the final operational state of a module entry.
pub trait Enrich: Send + Sync {
    /// Return the enriched entry or fail the whole record.
    fn enrich(&self, entry: ModuleEntry) -> Result<ModuleEntry, EnrichError>;
}

impl<F> Enrich for F
where
    F: Fn(ModuleEntry) -> Result<ModuleEntry, EnrichError> + Send + Sync,
{
    fn enrich(&self, entry: ModuleEntry) -> Result<ModuleEntry, EnrichError> {
        self(entry)
    }
}

/// Default enricher: takes the state from the entry's status fragment.
///
/// - fragment names a state: that state is used
/// - no fragment, or no `ModuleState` element in it: state left unchanged
/// - malformed fragment: error
#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentEnricher;

impl Enrich for FragmentEnricher {
    fn enrich(&self, mut entry: ModuleEntry) -> Result<ModuleEntry, EnrichError> {
        let Some(fragment) = entry.status_fragment.as_deref() else {
            return Ok(entry);
        };

        match read_module_state(fragment) {
            Ok(Some(state)) => {
                log::debug!("Module {} state set to {}", entry.module_id, state);
                entry.state = state;
                Ok(entry)
            }
            Ok(None) => {
                log::debug!(
                    "Module {} status has no recognizable state, keeping {}",
                    entry.module_id,
                    entry.state
                );
                Ok(entry)
            }
            Err(source) => Err(EnrichError::Fragment {
                module_id: entry.module_id,
                source,
            }),
        }
    }
}

/// Enricher that leaves every entry untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Enrich for Passthrough {
    fn enrich(&self, entry: ModuleEntry) -> Result<ModuleEntry, EnrichError> {
        Ok(entry)
    }
}
