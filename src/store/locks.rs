//! Striped per-key locks.
//!
//! Each key maps to one of a fixed number of mutex stripes. A caller that
//! needs several keys takes their stripes in ascending stripe order, so two
//! callers can never wait on each other in a cycle. Callers with disjoint
//! keys only contend when their keys share a stripe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// Default number of stripes.
pub const DEFAULT_STRIPES: usize = 64;

/// A fixed table of mutex stripes addressed by key.
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

/// Guards for every stripe a caller holds; released on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
    stripes: Vec<usize>,
}

impl KeyGuard<'_> {
    /// Stripe indices held, ascending.
    #[must_use]
    pub fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl KeyLocks {
    /// Create a table with `stripes` stripes (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Stripe index for `key`.
    #[must_use]
    pub fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock every stripe covering `keys`, blocking until all are held.
    pub fn lock<'k, I>(&self, keys: I) -> KeyGuard<'_>
    where
        I: IntoIterator<Item = &'k str>,
    {
        let mut stripes: Vec<usize> = keys.into_iter().map(|k| self.stripe_of(k)).collect();
        stripes.sort_unstable();
        stripes.dedup();

        let guards = stripes
            .iter()
            .map(|&i| self.stripes[i].lock().unwrap_or_else(|e| e.into_inner()))
            .collect();

        KeyGuard {
            _guards: guards,
            stripes,
        }
    }
}
