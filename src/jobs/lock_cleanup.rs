//! Expired-lock sweeper.
//!
//! Only meaningful for deployments embedding the process-local
//! [`InMemoryLockStore`]: the quorum store's replicas expire entries
//! themselves, but the in-memory map keeps expired entries until someone
//! reclaims them.

use crate::jobs::cancelled_within;
use crate::lock::InMemoryLockStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodic sweep of the in-memory lock store.
pub struct LockCleanupJob {
    store: Arc<InMemoryLockStore>,
    interval: Duration,
}

impl LockCleanupJob {
    pub fn new(store: Arc<InMemoryLockStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Sweep until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!("lock cleanup job started");
        while !cancelled_within(&token, self.interval).await {
            let swept = self.store.sweep_expired();
            if swept > 0 {
                info!(swept, "expired locks reclaimed");
                metrics::counter!("cleanup.locks.swept").increment(swept as u64);
            } else {
                debug!("no expired locks");
            }
        }
        info!("lock cleanup job stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockStore;

    #[tokio::test]
    async fn run_sweeps_until_cancelled() {
        let store = Arc::new(InMemoryLockStore::new());
        store
            .acquire("object:1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let job = LockCleanupJob::new(store.clone(), Duration::from_millis(5));
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let token = token.clone();
            async move { job.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(store.is_empty());
    }
}
