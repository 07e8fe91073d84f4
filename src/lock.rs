//! Reservation lock coordinator.
//!
//! Serialises admission decisions per requester. A lock is identified by a
//! single 64-bit key hashed from the user and team ids; acquisition retries
//! at a fixed interval until a deadline and the lock is released by a guard,
//! so every exit path (including errors and panics inside the critical
//! section) frees it.

use std::collections::HashSet;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::model::Requester;

/// Hash the full user and team ids into one lock key. A missing team counts
/// as 0. Keys are stable for the life of the process.
pub fn lock_key(requester: &Requester) -> u64 {
    let mut hasher = DefaultHasher::new();
    (requester.user_id, requester.team_id.unwrap_or(0)).hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
pub struct LockCoordinator {
    held: Mutex<HashSet<u64>>,
    retry_interval: Duration,
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    coordinator: &'a LockCoordinator,
    key: u64,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.key);
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl LockCoordinator {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            retry_interval,
        }
    }

    /// Take `key` if nobody holds it.
    pub fn try_acquire(&self, key: u64) -> Option<LockGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.insert(key).then(|| LockGuard { coordinator: self, key })
    }

    pub fn is_held(&self, key: u64) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }

    fn release(&self, key: u64) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        debug!(key = format_args!("{key:#x}"), "reservation lock released");
    }

    /// Acquire `key`, retrying every `retry_interval` until `timeout` has
    /// elapsed.
    pub async fn acquire(&self, key: u64, timeout: Duration) -> Result<LockGuard<'_>> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(key) {
                debug!(key = format_args!("{key:#x}"), "reservation lock acquired");
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited + self.retry_interval > timeout {
                warn!(key = format_args!("{key:#x}"), ?waited, "reservation lock timed out");
                return Err(EngineError::LockTimeout { key, waited });
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Run `f` while holding the requester's lock.
    ///
    /// The lock is released before returning whether `f` succeeds or fails;
    /// `f`'s error is then passed through unchanged.
    pub async fn with_lock<T, F, Fut>(
        &self,
        requester: &Requester,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.acquire(lock_key(requester), timeout).await?;
        f().await
    }
}
