//! Concurrent change detection cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use dashmap::DashMap;

use super::FileFingerprint;

/// Result of comparing a fresh fingerprint with the cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The key has never been accepted (or was pruned).
    New,
    /// The key is cached with a different fingerprint.
    Modified,
    /// The cached fingerprint is equal to the fresh one.
    Unchanged,
}

impl Change {
    /// Whether the file needs to be processed.
    #[must_use]
    pub fn is_changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Map from file path to the last accepted [`FileFingerprint`].
///
/// Backed by a sharded [`DashMap`], so checks and updates for different
/// files proceed in parallel and never block on a global lock.
///
/// # Ordering contract
///
/// [`clean`](Self::clean) must be given the complete listing of the cycle
/// it closes. The poller prunes only after every per-file check of the tick
/// has finished, so a file that is mid-check is never evicted.
#[derive(Debug, Default)]
pub struct ChangeDetectionCache {
    entries: DashMap<PathBuf, FileFingerprint>,
}

impl ChangeDetectionCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `fingerprint` with the cached value for `key` without mutating.
    pub fn check(&self, key: &Path, fingerprint: &FileFingerprint) -> Change {
        match self.entries.get(key) {
            Some(cached) if *cached == *fingerprint => Change::Unchanged,
            Some(_) => Change::Modified,
            None => Change::New,
        }
    }

    /// Whether `key` is new or its fingerprint differs from the cached one.
    ///
    /// Does not update the cache; call [`update`](Self::update) once the
    /// file has been processed successfully.
    pub fn has_changed(&self, key: &Path, fingerprint: &FileFingerprint) -> bool {
        let change = self.check(key, fingerprint);
        match change {
            Change::New => log::info!(
                "Detected new file {} ({})",
                key.display(),
                ByteSize(fingerprint.size())
            ),
            Change::Modified => log::info!("Changes detected in file {}", key.display()),
            Change::Unchanged => {}
        }
        change.is_changed()
    }

    /// Set or overwrite the fingerprint for `key`.
    pub fn update(&self, key: &Path, fingerprint: FileFingerprint) {
        self.entries.insert(key.to_path_buf(), fingerprint);
    }

    /// Remove every key that is not in `current`.
    ///
    /// # Returns
    ///
    /// The number of evicted entries.
    pub fn clean(&self, current: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            let keep = current.contains(key);
            if !keep {
                log::debug!("File {} was removed from cache", key.display());
            }
            keep
        });
        before.saturating_sub(self.entries.len())
    }

    /// The cached fingerprint for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &Path) -> Option<FileFingerprint> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Whether `key` is cached.
    #[must_use]
    pub fn contains(&self, key: &Path) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of cached files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
