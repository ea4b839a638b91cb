//! Distributed mutual exclusion keyed by root object id.
//!
//! Two swappable implementations behind the [`LockStore`] trait, selected by
//! explicit configuration: [`QuorumLockStore`] acquires a majority of
//! independent key-value replicas, [`InMemoryLockStore`] is a process-local
//! map for development. Contention is reported immediately as
//! [`LockError::AlreadyHeld`]; retry policy belongs to the caller, and
//! liveness after a crashed holder is recovered purely by TTL expiry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors surfaced by lock stores.
#[derive(Error, Debug)]
pub enum LockError {
    /// The resource is currently held by someone else. Not retried
    /// internally.
    #[error("lock already exists for resource {resource}")]
    AlreadyHeld { resource: String },

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Proof of exclusive ownership of a resource until `expires_at`.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub resource: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Exclusive lock store keyed by resource name.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Try to acquire `resource` exclusively for `ttl`. No blocking and no
    /// internal retry: contention returns [`LockError::AlreadyHeld`]
    /// immediately.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError>;

    /// Release a previously acquired handle. Releasing an expired or
    /// already-released handle is a no-op.
    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

/// One independent key-value voter in the quorum protocol: conditional
/// set-with-expiry on a random token, conditional delete-if-token-matches.
#[async_trait::async_trait]
pub trait LockReplica: Send + Sync {
    /// Set `(resource, token)` with expiry `ttl` only if `resource` is not
    /// currently held. Returns whether the replica accepted.
    async fn try_set(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `resource` only if it is held with `token`.
    async fn delete_if_match(&self, resource: &str, token: &str) -> Result<(), LockError>;
}

/// Quorum mutual exclusion over `N >= 3` independent replicas.
///
/// A random token is offered to every replica within a per-replica timeout
/// budget; the lock is held once a strict majority accepts and the elapsed
/// time plus a clock-drift allowance still leaves validity inside `ttl`.
/// On failure all partial acquisitions are released. An unreachable replica
/// simply fails to vote; it never blocks the majority decision.
pub struct QuorumLockStore {
    replicas: Vec<Arc<dyn LockReplica>>,
    replica_timeout: Duration,
    drift_factor: f64,
}

impl QuorumLockStore {
    pub fn new(
        replicas: Vec<Arc<dyn LockReplica>>,
        replica_timeout: Duration,
        drift_factor: f64,
    ) -> Self {
        Self {
            replicas,
            replica_timeout,
            drift_factor,
        }
    }

    fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    fn drift_allowance(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + Duration::from_millis(2)
    }

    async fn release_token(&self, resource: &str, token: &str) {
        for replica in &self.replicas {
            let unlock = replica.delete_if_match(resource, token);
            match tokio::time::timeout(self.replica_timeout, unlock).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(resource, error = %e, "replica release failed"),
                Err(_) => debug!(resource, "replica release timed out"),
            }
        }
    }
}

#[async_trait::async_trait]
impl LockStore for QuorumLockStore {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut votes = 0usize;

        for replica in &self.replicas {
            let set = replica.try_set(resource, &token, ttl);
            match tokio::time::timeout(self.replica_timeout, set).await {
                Ok(Ok(true)) => votes += 1,
                Ok(Ok(false)) => debug!(resource, "replica rejected lock"),
                Ok(Err(e)) => debug!(resource, error = %e, "replica vote failed"),
                Err(_) => debug!(resource, "replica vote timed out"),
            }
        }

        let elapsed = started.elapsed();
        let drift = self.drift_allowance(ttl);

        if votes >= self.quorum() && elapsed + drift < ttl {
            let validity = ttl - elapsed - drift;
            debug!(resource, votes, ?validity, "quorum lock acquired");
            Ok(LockHandle {
                resource: resource.to_string(),
                token,
                expires_at: Utc::now()
                    + chrono::Duration::from_std(validity)
                        .map_err(|e| LockError::Backend(e.to_string()))?,
            })
        } else {
            self.release_token(resource, &token).await;
            Err(LockError::AlreadyHeld {
                resource: resource.to_string(),
            })
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        self.release_token(&handle.resource, &handle.token).await;
        Ok(())
    }
}

/// Process-local lock store: a single key -> (token, expiry) map behind a
/// mutex.
///
/// Unsafe across multiple service instances; only the quorum store gives
/// mutual exclusion there. Expired entries are reclaimed lazily on acquire
/// and eagerly by [`sweep_expired`], which the lock cleanup job calls.
///
/// [`sweep_expired`]: InMemoryLockStore::sweep_expired
#[derive(Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry and return how many were reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }

    /// Number of live entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| LockError::Backend(e.to_string()))?;
        let mut entries = self.entries.lock();

        if let Some((_, held_until)) = entries.get(resource) {
            if *held_until > now {
                return Err(LockError::AlreadyHeld {
                    resource: resource.to_string(),
                });
            }
        }

        let token = Uuid::new_v4().to_string();
        entries.insert(resource.to_string(), (token.clone(), expires_at));
        Ok(LockHandle {
            resource: resource.to_string(),
            token,
            expires_at,
        })
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut entries = self.entries.lock();
        if let Some((token, _)) = entries.get(&handle.resource) {
            if *token == handle.token {
                entries.remove(&handle.resource);
            } else {
                warn!(
                    resource = %handle.resource,
                    "release with stale token ignored"
                );
            }
        }
        Ok(())
    }
}

/// In-memory [`LockReplica`]: the conditional set/delete semantics of one
/// independent key-value store. Backs the quorum tests and single-process
/// development.
#[derive(Default)]
pub struct InMemoryLockReplica {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockReplica {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LockReplica for InMemoryLockReplica {
    async fn try_set(&self, resource: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(resource) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                entries.insert(resource.to_string(), (token.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn delete_if_match(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut entries = self.entries.lock();
        if entries.get(resource).map(|(t, _)| t == token).unwrap_or(false) {
            entries.remove(resource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn quorum_store(replicas: Vec<Arc<dyn LockReplica>>) -> QuorumLockStore {
        QuorumLockStore::new(replicas, Duration::from_millis(100), 0.01)
    }

    fn three_replicas() -> Vec<Arc<dyn LockReplica>> {
        (0..3)
            .map(|_| Arc::new(InMemoryLockReplica::new()) as Arc<dyn LockReplica>)
            .collect()
    }

    /// Replica that always fails its vote.
    struct DownReplica;

    #[async_trait::async_trait]
    impl LockReplica for DownReplica {
        async fn try_set(&self, _: &str, _: &str, _: Duration) -> Result<bool, LockError> {
            Err(LockError::Backend("connection refused".to_string()))
        }

        async fn delete_if_match(&self, _: &str, _: &str) -> Result<(), LockError> {
            Err(LockError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn in_memory_second_acquire_is_contention() {
        let store = InMemoryLockStore::new();
        let handle = store.acquire("object:1", TTL).await.unwrap();

        let err = store.acquire("object:1", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));

        store.release(&handle).await.unwrap();
        store.acquire("object:1", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_distinct_resources_are_independent() {
        let store = InMemoryLockStore::new();
        store.acquire("object:1", TTL).await.unwrap();
        store.acquire("object:2", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_expired_lock_can_be_reacquired() {
        let store = InMemoryLockStore::new();
        store
            .acquire("object:1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.acquire("object:1", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_stale_token_release_keeps_current_holder() {
        let store = InMemoryLockStore::new();
        let first = store.acquire("object:1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _second = store.acquire("object:1", TTL).await.unwrap();

        // The expired holder's release must not free the new holder's lock.
        store.release(&first).await.unwrap();
        let err = store.acquire("object:1", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_entries() {
        let store = InMemoryLockStore::new();
        store
            .acquire("object:1", Duration::from_millis(1))
            .await
            .unwrap();
        store.acquire("object:2", TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep_expired(), 0);
    }

    #[tokio::test]
    async fn quorum_mutual_exclusion() {
        let store = quorum_store(three_replicas());

        let handle = store.acquire("object:1", TTL).await.unwrap();
        assert_eq!(handle.resource, "object:1");

        let err = store.acquire("object:1", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));

        store.release(&handle).await.unwrap();
        store.acquire("object:1", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn quorum_tolerates_minority_failure() {
        let mut replicas = three_replicas();
        replicas[2] = Arc::new(DownReplica);
        let store = quorum_store(replicas);

        store.acquire("object:1", TTL).await.unwrap();
    }

    #[tokio::test]
    async fn quorum_fails_without_majority() {
        let replicas: Vec<Arc<dyn LockReplica>> = vec![
            Arc::new(InMemoryLockReplica::new()),
            Arc::new(DownReplica),
            Arc::new(DownReplica),
        ];
        let store = quorum_store(replicas);

        let err = store.acquire("object:1", TTL).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn failed_quorum_releases_partial_acquisitions() {
        // A minority voter accepts, the acquisition fails overall, and the
        // partial hold must be rolled back so the resource stays free.
        let accepting = Arc::new(InMemoryLockReplica::new());
        let replicas: Vec<Arc<dyn LockReplica>> = vec![
            accepting.clone(),
            Arc::new(DownReplica),
            Arc::new(DownReplica),
        ];
        let store = quorum_store(replicas);

        store.acquire("object:1", TTL).await.unwrap_err();
        assert!(accepting.try_set("object:1", "probe", TTL).await.unwrap());
    }
}
