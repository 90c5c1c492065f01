//! Persistent module-state store.
//!
//! The store keeps the last applied state of every module, keyed by module
//! identifier, in a SQLite database:
//! - [`database`]: the [`ModuleStateStore`] with idempotent per-record apply
//! - [`locks`]: striped per-key locks serializing applies on the same module
//!
//! Applies on disjoint modules do not wait on each other's key locks. They
//! still share SQLite's single database write lock for the length of one
//! transaction.
//!
//! Applying the same record any number of times leaves the same rows
//! behind, which is what makes at-least-once delivery safe.

pub mod database;
pub mod locks;

use std::io;
use std::path::PathBuf;

pub use database::{ApplySummary, ModuleStateStore, PersistedModule};
pub use locks::KeyLocks;

/// Errors raised by the module-state store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The database file could not be opened or initialized.
    #[error("Failed to open store {path}: {source}")]
    Open {
        /// Database path
        path: PathBuf,
        /// The underlying SQLite error
        #[source]
        source: rusqlite::Error,
    },

    /// The directory for the database could not be created.
    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        /// Directory path
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// A query or transaction failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row holds a value this version does not understand.
    #[error("Invalid stored value for module {module_id}: {value}")]
    Corrupt {
        /// Module whose row is invalid
        module_id: String,
        /// The offending value
        value: String,
    },
}
