//! Keyed mutual exclusion.
//!
//! [`KeyedMutex`] serializes critical sections that share a key (a project
//! id) while leaving different keys fully concurrent. Waiters on a key are
//! served in arrival order because each key is backed by a fair
//! [`tokio::sync::Mutex`].
//!
//! There is no timeout: a critical section that never finishes blocks every
//! later caller for the same key.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Process-wide table of per-key locks.
///
/// Entries are created on first use and removed once nobody holds or waits
/// on them, so the table only contains keys with activity.
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive hold on one key. Dropping it releases the key.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedMutex,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedMutex {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        // Built before waiting so a caller cancelled while queued still
        // prunes the entry on drop.
        let mut held = KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: None,
        };
        held.guard = Some(mutex.lock_owned().await);
        tracing::trace!(key = %key, "Acquired keyed lock");
        held
    }

    /// Runs `critical_section` while holding the lock for `key`.
    ///
    /// The lock is released on every exit path, including errors returned by
    /// the section and cancellation of the returned future.
    pub async fn acquire<F, T>(&self, key: &str, critical_section: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        critical_section.await
    }

    /// Returns whether `key` is currently held or awaited.
    pub fn is_contended(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of keys with a holder or waiters.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }

    fn release(&self, key: &str) {
        // The map's own reference is the only one left when nobody holds or
        // waits on the key. Acquirers clone under the same shard lock, so the
        // check cannot race with a new waiter.
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // Drop the inner guard (and its Arc) before pruning the entry.
        let was_held = self.guard.take().is_some();
        self.owner.release(&self.key);
        if was_held {
            tracing::trace!(key = %self.key, "Released keyed lock");
        }
    }
}
