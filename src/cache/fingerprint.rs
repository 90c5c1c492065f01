//! File fingerprints used for change detection.

use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use crate::scanner::{hash_to_hex, Hash, Hasher, ScanError};

/// Immutable snapshot of a file's identity.
///
/// A fingerprint is computed once when the poller examines a file and is
/// replaced, never mutated, when the file changes.
///
/// # Equality
///
/// Two fingerprints are equal when modification time and size match and
/// either side has no content hash or both hashes match. A fingerprint
/// taken without hashing therefore equals one taken with hashing as long
/// as the metadata agrees. Because of that relaxation the relation is not
/// transitive, so `Eq` and `Hash` are not implemented.
#[derive(Clone, Copy)]
pub struct FileFingerprint {
    last_modified: SystemTime,
    size: u64,
    content_hash: Option<Hash>,
}

impl FileFingerprint {
    /// Build a fingerprint from known values.
    #[must_use]
    pub fn new(last_modified: SystemTime, size: u64, content_hash: Option<Hash>) -> Self {
        Self {
            last_modified,
            size,
            content_hash,
        }
    }

    /// Stat `path` and, in high-precision mode, hash its content.
    ///
    /// # Arguments
    ///
    /// * `path` - File to fingerprint
    /// * `hasher` - `Some` enables high-precision mode
    ///
    /// # Errors
    ///
    /// Returns a [`ScanError`]; [`ScanError::is_not_found`] is true when the
    /// file vanished between listing and inspection.
    pub fn from_path(path: &Path, hasher: Option<&Hasher>) -> Result<Self, ScanError> {
        let metadata = std::fs::metadata(path).map_err(|e| ScanError::from_io(path, e))?;
        let last_modified = metadata
            .modified()
            .map_err(|e| ScanError::from_io(path, e))?;

        let content_hash = match hasher {
            Some(hasher) => Some(hasher.full_hash(path)?),
            None => None,
        };

        Ok(Self::new(last_modified, metadata.len(), content_hash))
    }

    /// Last modification time, at the filesystem's resolution.
    #[must_use]
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// File size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Content digest, present only in high-precision mode.
    #[must_use]
    pub fn content_hash(&self) -> Option<&Hash> {
        self.content_hash.as_ref()
    }
}

impl PartialEq for FileFingerprint {
    fn eq(&self, other: &Self) -> bool {
        if self.last_modified != other.last_modified || self.size != other.size {
            return false;
        }

        match (&self.content_hash, &other.content_hash) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

impl fmt::Debug for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileFingerprint")
            .field("last_modified", &self.last_modified)
            .field("size", &self.size)
            .field("content_hash", &self.content_hash.as_ref().map(hash_to_hex))
            .finish()
    }
}
