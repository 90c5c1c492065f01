//! Status records: parsing, enrichment and production.
//!
//! This module turns a snapshot file on disk into a [`StatusRecord`] ready
//! for publishing:
//! - [`snapshot`]: XML snapshot parsing into the record model
//! - [`fragment`]: reading the state out of an embedded status fragment
//! - [`enrich`]: the pluggable per-module enrichment step
//! - [`producer`]: the [`RecordProducer`] that chains the above
//!
//! # Example
//!
//! ```
//! use statusrelay::record::{parse_snapshot_str, Enrich, FragmentEnricher, ModuleState};
//!
//! let xml = "<InstrumentStatus><DeviceStatus>\
//!            <ModuleCategoryID>PUMP</ModuleCategoryID>\
//!            <RapidControlStatus>&lt;S&gt;&lt;ModuleState&gt;Run&lt;/ModuleState&gt;&lt;/S&gt;</RapidControlStatus>\
//!            </DeviceStatus></InstrumentStatus>";
//!
//! let record = parse_snapshot_str(xml).unwrap();
//! let pump = FragmentEnricher.enrich(record.modules[0].clone()).unwrap();
//! assert_eq!(pump.state, ModuleState::Run);
//! ```

pub mod enrich;
pub mod fragment;
pub mod model;
pub mod producer;
pub mod snapshot;

use std::io;
use std::path::PathBuf;

pub use enrich::{Enrich, FragmentEnricher, Passthrough};
pub use fragment::read_module_state;
pub use model::{ModuleEntry, ModuleState, StatusRecord, UnknownModuleState};
pub use producer::{ProducedRecord, RecordProducer};
pub use snapshot::{parse_snapshot_file, parse_snapshot_str};

/// Errors raised while reading a snapshot or one of its fragments.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    /// The snapshot file could not be read.
    #[error("Failed to read snapshot {path}: {source}")]
    Read {
        /// Snapshot path
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The snapshot is not a well-formed status document.
    #[error("Malformed snapshot: {0}")]
    Malformed(String),

    /// An embedded status fragment is not well-formed XML.
    #[error("Malformed status fragment {0}")]
    Fragment(String),
}

/// Errors raised by an [`Enrich`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum EnrichError {
    /// The module's status fragment could not be read.
    #[error("Cannot enrich module {module_id}: {source}")]
    Fragment {
        /// Module being enriched
        module_id: String,
        /// The fragment error
        #[source]
        source: ParseError,
    },

    /// A custom enricher rejected the module.
    #[error("Cannot enrich module {module_id}: {reason}")]
    Rejected {
        /// Module being enriched
        module_id: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Errors that fail record production and leave the file to be retried.
#[derive(thiserror::Error, Debug)]
pub enum ProduceError {
    /// Enrichment failed for one of the modules.
    #[error(transparent)]
    Enrich(#[from] EnrichError),

    /// The enriched record could not be serialized.
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}
