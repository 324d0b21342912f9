//! Keyed, non-blocking mutual exclusion for logical operations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock key of the snapshot refresh.
pub const FULL_SYNC: &str = "full-sync";

#[derive(Debug, Default)]
struct LockTable {
    // key -> generation of the current holder
    held: HashMap<String, u64>,
    next_generation: u64,
}

/// A set of named flags, each either held or free.
///
/// Acquisition never waits: a caller that loses the race is expected to give
/// up, which is how concurrent automatic refreshes coalesce. All operations
/// go through one mutex, so at most one caller observes success between an
/// acquire and its matching release.
#[derive(Debug, Default)]
pub struct RequestLock {
    table: Mutex<LockTable>,
}

impl RequestLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` if it is free. Returns `false` if already held.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.acquire_generation(key).is_some()
    }

    /// Free `key` regardless of who holds it.
    pub fn release(&self, key: &str) {
        self.table().held.remove(key);
    }

    /// Clear a possibly stuck holder of `key`.
    ///
    /// Returns whether the key was held. Only user-initiated retries should
    /// call this.
    pub fn force_release(&self, key: &str) -> bool {
        let cleared = self.table().held.remove(key).is_some();
        if cleared {
            tracing::warn!(key, "request lock force-released");
        }
        cleared
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.table().held.contains_key(key)
    }

    /// Scoped form of [`try_acquire`](Self::try_acquire): the key is freed
    /// when the guard drops.
    pub fn try_lock(&self, key: &str) -> Option<RequestGuard<'_>> {
        self.acquire_generation(key).map(|generation| RequestGuard {
            lock: self,
            key: key.to_string(),
            generation,
        })
    }

    /// Force-clear `key`, then take it. Always succeeds.
    pub fn force_lock(&self, key: &str) -> RequestGuard<'_> {
        let mut table = self.table();
        if table.held.contains_key(key) {
            tracing::warn!(key, "request lock force-released");
        }
        let generation = Self::claim(&mut table, key);
        RequestGuard {
            lock: self,
            key: key.to_string(),
            generation,
        }
    }

    fn acquire_generation(&self, key: &str) -> Option<u64> {
        let mut table = self.table();
        if table.held.contains_key(key) {
            return None;
        }
        Some(Self::claim(&mut table, key))
    }

    fn claim(table: &mut LockTable, key: &str) -> u64 {
        let generation = table.next_generation;
        table.next_generation = table.next_generation.wrapping_add(1);
        table.held.insert(key.to_string(), generation);
        generation
    }

    fn holds(&self, key: &str, generation: u64) -> bool {
        self.table().held.get(key) == Some(&generation)
    }

    fn release_generation(&self, key: &str, generation: u64) {
        let mut table = self.table();
        if table.held.get(key) == Some(&generation) {
            table.held.remove(key);
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one key of a [`RequestLock`] until dropped.
///
/// A guard whose key was force-released and re-taken by someone else does not
/// free the new holder's claim on drop.
#[derive(Debug)]
#[must_use = "the key is released as soon as the guard is dropped"]
pub struct RequestGuard<'a> {
    lock: &'a RequestLock,
    key: String,
    generation: u64,
}

impl RequestGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this guard still owns its key, i.e. nobody force-released
    /// and re-took it since.
    pub fn is_current(&self) -> bool {
        self.lock.holds(&self.key, self.generation)
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_generation(&self.key, self.generation);
    }
}
