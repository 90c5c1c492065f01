//! Scanner module for watching the snapshot input directory.
//!
//! This module provides functionality for:
//! - Listing the snapshot files that match the configured glob
//! - Content hashing with BLAKE3 for high-precision change detection
//! - The periodic [`DirectoryPoller`] that drives change detection and
//!   dispatches new or changed files to a handler
//!
//! # Architecture
//!
//! The scanner is divided into submodules:
//! - [`listing`]: single-level directory listing with glob filtering
//! - [`hasher`]: BLAKE3 file hashing (streaming)
//! - [`poller`]: the tick loop (`Idle -> Scanning -> Dispatching -> Idle`)
//!
//! # Example
//!
//! ```no_run
//! use statusrelay::scanner::{DirectoryPoller, PollerConfig};
//! use statusrelay::signal::create_handler;
//! use std::path::Path;
//!
//! let config = PollerConfig::new("./input");
//! let poller = DirectoryPoller::new(config, create_handler()).unwrap();
//!
//! // One scan cycle; the handler sees each new or changed file once.
//! let summary = poller
//!     .tick(&|path: &Path| -> Result<(), std::io::Error> {
//!         println!("changed: {}", path.display());
//!         Ok(())
//!     })
//!     .unwrap();
//! println!("{} files listed", summary.listed);
//! ```

pub mod hasher;
pub mod listing;
pub mod poller;

use std::io;
use std::path::{Path, PathBuf};

pub use hasher::{hash_to_hex, Hash, Hasher};
pub use listing::{list_matching, FilePattern};
pub use poller::{CheckOutcome, DirectoryPoller, PollerConfig, PollerStats, TickSummary};

/// Errors that can occur while listing or inspecting snapshot files.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// Permission was denied when accessing a file or directory.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The specified path was not found.
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// The specified path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The configured file pattern is not a valid glob.
    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// Why the glob was rejected
        reason: String,
    },

    /// The worker pool for per-file checks could not be built.
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),

    /// Content hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),

    /// An I/O error occurred while accessing a file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl ScanError {
    /// Classify an I/O error for `path`.
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    /// Whether the error means the file no longer exists.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Hash(HashError::NotFound(_))
        )
    }
}

/// Errors that can occur during file hashing.
#[derive(thiserror::Error, Debug)]
pub enum HashError {
    /// The specified file was not found.
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Permission was denied when reading the file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// An I/O error occurred while reading the file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl HashError {
    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}
