//! Change detection for snapshot files.
//!
//! This module decides whether a file the poller sees is "new work".
//!
//! # Architecture
//!
//! * [`fingerprint`]: the immutable [`FileFingerprint`] (mtime, size, optional
//!   BLAKE3 digest) and its equality rule.
//! * [`detector`]: the concurrent [`ChangeDetectionCache`] keyed by path.
//!
//! # Cache Invalidation
//!
//! An entry is replaced when a file's modification time or size changes, or,
//! in high-precision mode, when its content digest changes. Entries for files
//! that disappear from the input directory are pruned at the end of each
//! scan cycle. The cache lives in memory only: after a restart every file is
//! treated as new and relayed again, which the idempotent store absorbs.

pub mod detector;
pub mod fingerprint;

pub use detector::{Change, ChangeDetectionCache};
pub use fingerprint::FileFingerprint;
