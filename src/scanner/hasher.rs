//! BLAKE3 file hasher with streaming support.
//!
//! # Overview
//! This module provides the [`Hasher`] struct used by high-precision change
//! detection. Snapshot files are usually small, so they are streamed through
//! a buffered reader; files above [`MMAP_THRESHOLD`] are memory-mapped instead.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::HashError;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Files at least this large are hashed through a memory map.
pub const MMAP_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Streaming BLAKE3 hasher for file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hasher;

impl Hasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Hash the full content of a file.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::NotFound`] if the file disappeared,
    /// [`HashError::PermissionDenied`] if it cannot be opened, and
    /// [`HashError::Io`] for any other read failure.
    pub fn full_hash(&self, path: &Path) -> Result<Hash, HashError> {
        let file = File::open(path).map_err(|e| HashError::from_io(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| HashError::from_io(path, e))?
            .len();

        let mut hasher = blake3::Hasher::new();
        if len >= MMAP_THRESHOLD {
            hasher
                .update_mmap(path)
                .map_err(|e| HashError::from_io(path, e))?;
        } else {
            hasher
                .update_reader(BufReader::new(file))
                .map_err(|e| HashError::from_io(path, e))?;
        }

        Ok(*hasher.finalize().as_bytes())
    }

    /// Hash an in-memory buffer.
    #[must_use]
    pub fn hash_bytes(&self, bytes: &[u8]) -> Hash {
        *blake3::hash(bytes).as_bytes()
    }
}

/// Render a digest as lowercase hex.
#[must_use]
pub fn hash_to_hex(hash: &Hash) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}
