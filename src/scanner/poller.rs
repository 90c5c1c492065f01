//! Periodic directory poller.
//!
//! # Overview
//!
//! [`DirectoryPoller`] runs a fixed-interval scan loop over the input
//! directory. Every tick it:
//!
//! 1. Lists the files matching the configured glob. A listing failure is
//!    logged and the tick is skipped.
//! 2. Checks every listed file on a bounded rayon pool: re-verifies that it
//!    still exists, fingerprints it and asks the [`ChangeDetectionCache`]
//!    whether it changed.
//! 3. Invokes the handler for changed files and commits the new fingerprint
//!    only when the handler succeeds. A failed file is therefore retried on
//!    the next tick.
//! 4. Prunes cache entries for files that were not in this tick's listing,
//!    after all per-file checks have returned.
//!
//! Failures are isolated per file and per tick; nothing short of the
//! shutdown signal stops the loop.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::listing::{list_matching, FilePattern};
use super::{Hasher, ScanError};
use crate::cache::{ChangeDetectionCache, FileFingerprint};
use crate::signal::ShutdownHandler;

/// Default interval between scans.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default bound on concurrent per-file checks.
pub const DEFAULT_WORKERS: usize = 4;

/// Configuration for the directory poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Directory to scan (top level only).
    pub directory: PathBuf,
    /// Glob selecting snapshot files.
    pub pattern: String,
    /// Wall-clock interval between tick starts.
    pub interval: Duration,
    /// Enable high-precision mode (content digest in fingerprints).
    pub use_hash: bool,
    /// Maximum number of files checked concurrently within one tick.
    pub workers: usize,
}

impl PollerConfig {
    /// Create a configuration with defaults for everything but the directory.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            pattern: "*.xml".to_string(),
            interval: DEFAULT_INTERVAL,
            use_hash: false,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Set the file glob.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    /// Set the scan interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable high-precision mode.
    #[must_use]
    pub fn with_hash(mut self, use_hash: bool) -> Self {
        self.use_hash = use_hash;
        self
    }

    /// Set the per-tick worker bound (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// What happened to one listed file during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Fingerprint equals the cached one; handler not invoked.
    Unchanged,
    /// The file disappeared after listing; skipped without error.
    Vanished,
    /// Handler succeeded and the fingerprint was committed.
    Processed,
    /// Fingerprinting or the handler failed; fingerprint not committed.
    Failed,
    /// Shutdown was requested before the file was checked.
    Cancelled,
}

/// Counters for a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Files returned by the listing.
    pub listed: usize,
    /// Files whose fingerprint matched the cache.
    pub unchanged: usize,
    /// Files that vanished between listing and check.
    pub vanished: usize,
    /// Files handed to the handler successfully.
    pub processed: usize,
    /// Files that failed and will be retried next tick.
    pub failed: usize,
    /// Files skipped because of shutdown.
    pub cancelled: usize,
    /// Cache entries pruned at the end of the tick.
    pub evicted: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: CheckOutcome) {
        match outcome {
            CheckOutcome::Unchanged => self.unchanged += 1,
            CheckOutcome::Vanished => self.vanished += 1,
            CheckOutcome::Processed => self.processed += 1,
            CheckOutcome::Failed => self.failed += 1,
            CheckOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Totals accumulated by [`DirectoryPoller::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStats {
    /// Ticks that listed the directory successfully.
    pub ticks: u64,
    /// Ticks skipped because the listing failed.
    pub failed_ticks: u64,
    /// Files processed successfully.
    pub processed: u64,
    /// File checks that failed.
    pub failed: u64,
}

/// Fixed-interval scanner that dispatches new or changed files.
pub struct DirectoryPoller {
    config: PollerConfig,
    pattern: FilePattern,
    cache: ChangeDetectionCache,
    hasher: Option<Hasher>,
    pool: rayon::ThreadPool,
    shutdown: ShutdownHandler,
}

impl std::fmt::Debug for DirectoryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryPoller")
            .field("config", &self.config)
            .field("cached_files", &self.cache.len())
            .finish()
    }
}

impl DirectoryPoller {
    /// Create a poller.
    ///
    /// # Errors
    ///
    /// Fails if the glob is invalid or the worker pool cannot be built.
    pub fn new(config: PollerConfig, shutdown: ShutdownHandler) -> Result<Self, ScanError> {
        let pattern = FilePattern::new(&config.directory, &config.pattern)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("statusrelay-check-{}", i))
            .build()
            .map_err(|e| ScanError::WorkerPool(e.to_string()))?;
        let hasher = config.use_hash.then(Hasher::new);

        Ok(Self {
            config,
            pattern,
            cache: ChangeDetectionCache::new(),
            hasher,
            pool,
            shutdown,
        })
    }

    /// The poller configuration.
    #[must_use]
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// The change detection cache owned by this poller.
    #[must_use]
    pub fn cache(&self) -> &ChangeDetectionCache {
        &self.cache
    }

    /// Run ticks on the configured interval until shutdown is requested.
    ///
    /// The first tick starts immediately. Tick starts are aligned to the
    /// interval; a tick that overruns its slot is followed by the next one
    /// right away rather than by a burst of catch-up ticks.
    pub fn run<F, E>(&self, handler: F) -> PollerStats
    where
        F: Fn(&Path) -> Result<(), E> + Sync,
        E: Display,
    {
        let mode = if self.hasher.is_some() {
            " High precision mode."
        } else {
            ""
        };
        log::info!(
            "Polling started. Directory: {}, pattern: {}, interval: {}ms.{}",
            self.config.directory.display(),
            self.pattern.as_str(),
            self.config.interval.as_millis(),
            mode
        );

        let mut stats = PollerStats::default();
        let mut next_tick = Instant::now();

        while !self.shutdown.is_shutdown_requested() {
            match self.tick(&handler) {
                Ok(summary) => {
                    stats.ticks += 1;
                    stats.processed += summary.processed as u64;
                    stats.failed += summary.failed as u64;
                    log::trace!("Tick finished: {:?}", summary);
                }
                Err(e) => {
                    stats.failed_ticks += 1;
                    log::error!("Scan of {} failed: {}", self.config.directory.display(), e);
                }
            }

            next_tick += self.config.interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now;
            }
            if self.shutdown.wait_timeout(next_tick - now) {
                break;
            }
        }

        log::info!("Polling stopped.");
        stats
    }

    /// Run a single scan cycle.
    ///
    /// # Errors
    ///
    /// Returns the listing error; per-file failures are counted in the
    /// summary instead.
    pub fn tick<F, E>(&self, handler: &F) -> Result<TickSummary, ScanError>
    where
        F: Fn(&Path) -> Result<(), E> + Sync,
        E: Display,
    {
        let files = list_matching(&self.config.directory, &self.pattern)?;
        let current: HashSet<PathBuf> = files.iter().cloned().collect();

        let outcomes: Vec<CheckOutcome> = self.pool.install(|| {
            files
                .par_iter()
                .map(|path| self.check_file(path, handler))
                .collect()
        });

        let mut summary = TickSummary {
            listed: files.len(),
            ..TickSummary::default()
        };
        for outcome in outcomes {
            summary.record(outcome);
        }

        // Every check above has returned, so no in-flight key can be evicted.
        summary.evicted = self.cache.clean(&current);

        Ok(summary)
    }

    /// Check one file and dispatch it to `handler` if it is new or changed.
    pub fn check_file<F, E>(&self, path: &Path, handler: &F) -> CheckOutcome
    where
        F: Fn(&Path) -> Result<(), E> + Sync,
        E: Display,
    {
        if self.shutdown.is_shutdown_requested() {
            return CheckOutcome::Cancelled;
        }

        if !path.exists() {
            log::debug!("File {} was not found before processing", path.display());
            return CheckOutcome::Vanished;
        }

        let fingerprint = match FileFingerprint::from_path(path, self.hasher.as_ref()) {
            Ok(fingerprint) => fingerprint,
            Err(e) if e.is_not_found() => {
                log::debug!("File {} vanished while fingerprinting", path.display());
                return CheckOutcome::Vanished;
            }
            Err(e) => {
                log::error!("Error during check of file {}: {}", path.display(), e);
                return CheckOutcome::Failed;
            }
        };

        if !self.cache.has_changed(path, &fingerprint) {
            log::debug!("File {} was not changed", path.display());
            return CheckOutcome::Unchanged;
        }

        match handler(path) {
            Ok(()) => {
                self.cache.update(path, fingerprint);
                CheckOutcome::Processed
            }
            Err(e) => {
                log::error!(
                    "Error during processing of file {}: {} (will retry next tick)",
                    path.display(),
                    e
                );
                CheckOutcome::Failed
            }
        }
    }
}
