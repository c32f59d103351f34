//! Shared concurrency primitives for the bisection engine.
//!
//! Two structures live here:
//!
//! - [`Semaphore`]: the job-wide admission gate. Every replica acquires one
//!   permit before starting a probe (build + container + healthchecks) and
//!   releases it when the oracle's verdict arrives, bounding how many systems
//!   are being built or are running at once.
//! - [`CommitLocks`]: a sharded lock table keyed by commit hash that
//!   guarantees at most one image build is in flight per commit across the
//!   whole process, no matter how many replicas converge on the same commit.
//!
//! # Thread model
//!
//! Both structures use [`std::sync::Mutex`] + [`std::sync::Condvar`]; waiters
//! block their worker thread. Semaphore waits poll with a timeout so a
//! stopped replica can abandon the wait without a dedicated wakeup channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How often a blocked [`Semaphore::acquire`] re-checks its stop flag.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Number of shards in the commit lock table. Commit hashes distribute
/// uniformly, so a small power of two keeps contention negligible.
const LOCK_SHARDS: usize = 16;

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// A counting semaphore with RAII permits.
///
/// # Panics
///
/// All methods panic if the internal mutex is poisoned.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `permits` available permits. Use
    /// [`usize::MAX`] for an effectively unbounded semaphore.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, or until `stop` becomes true.
    ///
    /// Returns `None` when the wait was abandoned because of the stop flag.
    pub fn acquire(&self, stop: &AtomicBool) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if *permits > 0 {
                *permits -= 1;
                return Some(SemaphorePermit { parent: self });
            }
            let (guard, _timeout) = self
                .available
                .wait_timeout(permits, ACQUIRE_POLL_INTERVAL)
                .expect("semaphore lock poisoned");
            permits = guard;
        }
    }

    fn release(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        *permits = permits.saturating_add(1);
        drop(permits);
        self.available.notify_one();
    }
}

/// RAII permit returned by [`Semaphore::acquire`]; releases on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    parent: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.parent.release();
    }
}

// ---------------------------------------------------------------------------
// Per-commit build locks
// ---------------------------------------------------------------------------

/// Sharded table of per-commit mutexes.
///
/// `lock_for` hands out an `Arc<Mutex<()>>` for the commit; callers lock it
/// for the duration of a build-or-fetch. Entries are created on first use and
/// never removed: the set of commits in a bisection is small and fixed.
#[derive(Debug)]
pub struct CommitLocks {
    shards: Vec<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Default for CommitLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(LOCK_SHARDS);
        for _ in 0..LOCK_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    /// Return the build mutex for `commit`, creating it if absent.
    ///
    /// # Panics
    ///
    /// Panics if the shard mutex is poisoned.
    #[must_use]
    pub fn lock_for(&self, commit: &str) -> Arc<Mutex<()>> {
        let shard = &self.shards[Self::shard_index(commit)];
        let mut map = shard.lock().expect("commit lock shard poisoned");
        Arc::clone(
            map.entry(commit.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn shard_index(commit: &str) -> usize {
        // Commit hashes are hex; folding the bytes is as uniform as hashing.
        let sum: usize = commit.bytes().map(usize::from).sum();
        sum % LOCK_SHARDS
    }
}
