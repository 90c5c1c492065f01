//! Signal handling for graceful shutdown.
//!
//! This module provides centralized Ctrl+C / SIGTERM handling for both
//! StatusRelay processes. A single [`ShutdownHandler`] is shared by the
//! directory poller, the broker drivers and the consumer loop. Besides the
//! `AtomicBool` flag that workers poll, the handler carries a condition
//! variable so that interval waits wake up as soon as shutdown is requested.
//!
//! # Usage
//!
//! ```rust,no_run
//! use statusrelay::signal::install_handler;
//! use std::time::Duration;
//!
//! let handler = install_handler().expect("Failed to install signal handler");
//!
//! // Sleep for one poll interval, or less if Ctrl+C arrives.
//! if handler.wait_timeout(Duration::from_secs(1)) {
//!     println!("Shutdown requested, leaving the loop");
//! }
//! ```
//!
//! # Exit Codes
//!
//! When a signal is received:
//! - The shutdown flag is set to `true` and all waiters are woken
//! - A message "Interrupted. Finishing in-flight work..." is printed to stderr
//! - The application should exit with code 130 (128 + SIGINT)

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Exit code for SIGINT (Ctrl+C) interruption.
/// This follows Unix convention: 128 + signal number (SIGINT = 2).
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Centralized shutdown handler for cooperative cancellation.
///
/// Cloning the handler shares the same flag and wake-up signal, so one
/// `request_shutdown()` stops every loop holding a clone.
///
/// # Thread Safety
///
/// `ShutdownHandler` is `Send` and `Sync`. The flag uses atomic operations;
/// the condition variable is only used to cut sleeps short.
#[derive(Debug, Clone)]
pub struct ShutdownHandler {
    /// The shared atomic flag indicating shutdown was requested.
    flag: Arc<AtomicBool>,
    /// Wakes threads parked in [`ShutdownHandler::wait_timeout`].
    wakeup: Arc<(Mutex<()>, Condvar)>,
}

impl ShutdownHandler {
    /// Create a new shutdown handler with the flag initially set to `false`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    /// Check if shutdown has been requested.
    ///
    /// # Returns
    ///
    /// `true` if Ctrl+C was pressed or `request_shutdown()` was called.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Manually request a shutdown and wake every waiting thread.
    pub fn request_shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wakeup;
        // Taking the lock orders the store before any waiter re-checks the flag.
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cvar.notify_all();
    }

    /// Block for at most `timeout`, returning early if shutdown is requested.
    ///
    /// # Returns
    ///
    /// `true` if shutdown was requested before or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.wakeup;
        let mut guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        loop {
            if self.is_shutdown_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match cvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Reset the shutdown flag to `false`.
    ///
    /// This is primarily useful for testing scenarios where you want to
    /// reuse a handler.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Failure to hook Ctrl+C / SIGTERM.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The OS refused the handler.
    #[error("Failed to install signal handler: {0}")]
    InstallFailed(#[from] ctrlc::Error),
}

static INSTALLED: Mutex<Option<ShutdownHandler>> = Mutex::new(None);

/// Hook Ctrl+C / SIGTERM to a process-wide [`ShutdownHandler`].
///
/// The first call registers the hook. Later calls hand out the same handler
/// with its flag cleared, so each `run_app` invocation in one process starts
/// un-cancelled. Registration happens under a lock; concurrent first calls
/// all receive the hooked handler.
///
/// # Errors
///
/// Returns [`SignalError::InstallFailed`] when the hook cannot be set and
/// no handler of ours is registered yet.
pub fn install_handler() -> Result<ShutdownHandler, SignalError> {
    let mut installed = INSTALLED.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = installed.as_ref() {
        existing.reset();
        return Ok(existing.clone());
    }

    let handler = ShutdownHandler::new();
    let hooked = handler.clone();
    let registered = ctrlc::set_handler(move || {
        hooked.request_shutdown();
        let mut stderr = std::io::stderr();
        let _ = writeln!(stderr, "\nInterrupted. Finishing in-flight work...");
        let _ = stderr.flush();
        log::info!("Shutdown signal received");
    });

    match registered {
        Ok(()) => {}
        // Someone else owns the signal; loops can still be stopped programmatically.
        Err(ctrlc::Error::MultipleHandlers) => {
            log::debug!("A Ctrl+C handler is already registered; shutdown must be requested explicitly");
        }
        Err(e) => return Err(SignalError::InstallFailed(e)),
    }

    *installed = Some(handler.clone());
    Ok(handler)
}

/// A handler with no signal hook, for tests and embedders.
#[must_use]
pub fn create_handler() -> ShutdownHandler {
    ShutdownHandler::new()
}
