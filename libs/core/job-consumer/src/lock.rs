//! Per-job distributed lock
//!
//! Acquisition is a single `SET key token NX EX ttl`. Release is a
//! compare-and-delete on the acquisition token, so a lock that expired and was
//! taken by another worker is never released by the previous holder. There is
//! no renewal: a job running longer than the TTL can be picked up twice.

use crate::error::StoreError;
use crate::store::KeyValueStore;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// A held lock. Release it with [`JobLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLock {
    key: String,
    token: String,
    ttl: Duration,
}

impl JobLock {
    /// Try to take the lock under `key`; `None` when another holder owns it.
    pub async fn acquire(
        store: &dyn KeyValueStore,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, StoreError> {
        let token = format!("{owner}:{}", Uuid::new_v4());

        if store.set_if_absent(key, &token, ttl).await? {
            debug!(lock = %key, token = %token, "Lock acquired");
            Ok(Some(Self {
                key: key.to_string(),
                token,
                ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Compare-and-delete on the acquisition token.
    ///
    /// Returns `false` when the lock had already expired or changed hands.
    pub async fn release(self, store: &dyn KeyValueStore) -> Result<bool, StoreError> {
        let released = store.delete_if_equals(&self.key, &self.token).await?;
        if released {
            debug!(lock = %self.key, "Lock released");
        } else {
            warn!(lock = %self.key, ttl = ?self.ttl, "Lock was no longer held at release");
        }
        Ok(released)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_single_holder() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        let first = JobLock::acquire(&store, "lock:w:1", "worker-a", ttl)
            .await
            .unwrap()
            .expect("first acquisition succeeds");
        assert!(first.token().starts_with("worker-a:"));

        let second = JobLock::acquire(&store, "lock:w:1", "worker-b", ttl)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(first.release(&store).await.unwrap());
        assert!(
            JobLock::acquire(&store, "lock:w:1", "worker-b", ttl)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_release_does_not_steal_foreign_lock() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        let stale = JobLock::acquire(&store, "lock:w:1", "worker-a", ttl)
            .await
            .unwrap()
            .unwrap();

        // Simulate expiry and takeover by another worker
        store.delete("lock:w:1").await.unwrap();
        let current = JobLock::acquire(&store, "lock:w:1", "worker-b", ttl)
            .await
            .unwrap()
            .unwrap();

        assert!(!stale.release(&store).await.unwrap());
        assert_eq!(
            store.get("lock:w:1").await.unwrap().as_deref(),
            Some(current.token())
        );
    }
}
