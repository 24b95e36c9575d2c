//! Distributed lock
//!
//! A Redis-SETNX-style mutual exclusion lock used to make agent dispatch
//! idempotent across worker replicas: only the worker that wins the lock for
//! `session:<id>:execute` actually runs the agent (see SPEC_FULL.md §4.3).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::store::{StoreBackend, StoreError, StoreKey};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("failed to acquire lock {0:?} within {1:?}")]
    AcquireTimeout(String, Duration),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A held or not-yet-acquired distributed lock.
///
/// Acquire with [`DistributedLock::acquire`]; the lock is released by
/// calling [`DistributedLock::release`] explicitly — there is no `Drop`
/// auto-release since release is an async, fallible operation and callers
/// must decide how to handle a failed release (log and move on, in every
/// caller in this crate).
pub struct DistributedLock {
    store: std::sync::Arc<dyn StoreBackend>,
    key: String,
    token: String,
    ttl: Duration,
    acquired: bool,
}

impl DistributedLock {
    pub fn new(store: std::sync::Arc<dyn StoreBackend>, name: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: StoreKey::lock(name),
            token: Uuid::new_v4().to_string(),
            ttl,
            acquired: false,
        }
    }

    /// Poll every 100ms until the lock is acquired or `timeout` elapses.
    pub async fn acquire(&mut self, timeout: Duration) -> Result<bool, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let got = self
                .store
                .set_nx(&self.key, self.token.clone().into_bytes(), Some(self.ttl))
                .await?;
            if got {
                self.acquired = true;
                tracing::debug!(key = %self.key, "lock acquired");
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(key = %self.key, ?timeout, "lock acquisition timed out");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Release the lock if we still own it. No-op if never acquired.
    pub async fn release(&mut self) -> Result<bool, LockError> {
        if !self.acquired {
            return Ok(false);
        }
        let released = self.store.release_if_owner(&self.key, &self.token).await?;
        self.acquired = false;
        if released {
            tracing::debug!(key = %self.key, "lock released");
        }
        Ok(released)
    }

    /// Extend the TTL if we still own it. Used by long-running dispatch
    /// tasks to stay inside the lock past its initial TTL.
    pub async fn extend(&self, additional: Duration) -> Result<bool, LockError> {
        if !self.acquired {
            return Ok(false);
        }
        Ok(self
            .store
            .extend_if_owner(&self.key, &self.token, additional)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::memory::InMemoryStore;
    use std::sync::Arc;

    fn store() -> Arc<dyn StoreBackend> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = store();
        let mut lock = DistributedLock::new(store, "session:s1:execute", Duration::from_secs(30));
        assert!(lock.acquire(Duration::from_secs(1)).await.unwrap());
        assert!(lock.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_blocked_until_released() {
        let store = store();
        let mut lock1 = DistributedLock::new(
            store.clone(),
            "session:s1:execute",
            Duration::from_secs(30),
        );
        let mut lock2 = DistributedLock::new(
            store.clone(),
            "session:s1:execute",
            Duration::from_secs(30),
        );

        assert!(lock1.acquire(Duration::from_secs(1)).await.unwrap());
        assert!(!lock2.acquire(Duration::from_millis(250)).await.unwrap());

        lock1.release().await.unwrap();
        assert!(lock2.acquire(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_without_ownership_is_noop() {
        let store = store();
        let mut lock = DistributedLock::new(store, "session:s1:execute", Duration::from_secs(30));
        assert!(!lock.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_requires_ownership() {
        let store = store();
        let mut lock = DistributedLock::new(store, "session:s1:execute", Duration::from_secs(30));
        assert!(!lock.extend(Duration::from_secs(10)).await.unwrap());
        lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lock.extend(Duration::from_secs(10)).await.unwrap());
    }
}
