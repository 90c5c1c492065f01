//! Single-level listing of the snapshot input directory.
//!
//! Only regular files directly inside the input directory are considered;
//! subdirectories are never descended into. Names are filtered with a glob
//! (`*.xml` by default) compiled through the `ignore` crate's override
//! matcher, the same engine ripgrep uses for `--glob`.

use std::path::{Path, PathBuf};

use ignore::overrides::{Override, OverrideBuilder};
use walkdir::WalkDir;

use super::ScanError;

/// Compiled glob used to select snapshot files.
#[derive(Debug, Clone)]
pub struct FilePattern {
    pattern: String,
    matcher: Override,
}

impl FilePattern {
    /// Compile `pattern` relative to `root`.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InvalidPattern`] for an empty or malformed glob.
    pub fn new(root: &Path, pattern: &str) -> Result<Self, ScanError> {
        let invalid = |reason: String| ScanError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.trim().is_empty() {
            return Err(invalid("pattern is empty".to_string()));
        }

        let mut builder = OverrideBuilder::new(root);
        builder
            .add(pattern)
            .map_err(|e| invalid(e.to_string()))?;
        let matcher = builder.build().map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    /// The glob this matcher was compiled from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether a file path matches the glob.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        self.matcher.matched(path, false).is_whitelist()
    }
}

/// List the files directly inside `dir` that match `pattern`.
///
/// The result is sorted so that logs are stable between ticks.
///
/// # Errors
///
/// Fails when the directory itself cannot be read (missing, not a directory,
/// permission denied). Problems with individual entries are logged and the
/// entry is skipped.
pub fn list_matching(dir: &Path, pattern: &FilePattern) -> Result<Vec<PathBuf>, ScanError> {
    let metadata = std::fs::metadata(dir).map_err(|e| ScanError::from_io(dir, e))?;
    if !metadata.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                return Err(ScanError::from_io(dir, source));
            }
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        if pattern.matches(&path) {
            files.push(path);
        } else {
            log::trace!("Ignoring non-matching file: {}", path.display());
        }
    }

    Ok(files)
}
