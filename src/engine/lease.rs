//! Lease-based leader election.
//!
//! Exactly one replica may drive buyback cycles at a time. Leadership is a
//! time-bounded lease row renewed on a heartbeat; a holder that fails to
//! renew is demoted and must re-attempt acquisition on its next tick. This is
//! deliberately optimistic, lease-based mutual exclusion, not consensus —
//! the dual-leadership window is bounded by the heartbeat interval and the
//! persistent rate limiter bounds what a briefly duplicated leader can do.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::storage::EngineStorage;

/// The single coordinated resource in this system.
pub const CYCLE_DRIVER_RESOURCE: &str = "cycle-driver";

pub struct LeaseManager {
    storage: Arc<dyn EngineStorage>,
    resource: String,
    instance_id: String,
    ttl_ms: i64,
}

impl LeaseManager {
    pub fn new(storage: Arc<dyn EngineStorage>, instance_id: String, ttl: Duration) -> Self {
        Self {
            storage,
            resource: CYCLE_DRIVER_RESOURCE.to_string(),
            instance_id,
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Attempt to take the lease. Succeeds when it is free, expired, or
    /// already ours; the decision is a single compare-and-set in the store.
    pub async fn try_acquire(&self) -> Result<bool> {
        let acquired = self
            .storage
            .acquire_lease(&self.resource, &self.instance_id, now_ms(), self.ttl_ms)
            .await?;

        if acquired {
            debug!("instance {} holds the {} lease", self.instance_id, self.resource);
        }
        Ok(acquired)
    }

    /// Extend the lease strictly before it expires. A false return means
    /// leadership was lost; the caller must stop acting as leader.
    pub async fn renew(&self) -> Result<bool> {
        let renewed = self
            .storage
            .renew_lease(&self.resource, &self.instance_id, now_ms(), self.ttl_ms)
            .await?;

        if !renewed {
            warn!(
                "instance {} failed to renew the {} lease; demoting",
                self.instance_id, self.resource
            );
        }
        Ok(renewed)
    }

    /// Whether this instance currently holds an unexpired lease.
    pub async fn is_holder(&self) -> Result<bool> {
        let lease = self.storage.get_lease(&self.resource).await?;
        Ok(lease
            .map(|l| l.owner_id == self.instance_id && l.expires_at > now_ms())
            .unwrap_or(false))
    }

    /// Give the lease up voluntarily (shutdown path).
    pub async fn release(&self) -> Result<()> {
        self.storage
            .release_lease(&self.resource, &self.instance_id)
            .await?;
        info!("instance {} released the {} lease", self.instance_id, self.resource);
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::SqliteStore;

    fn manager(storage: Arc<dyn EngineStorage>, id: &str) -> LeaseManager {
        LeaseManager::new(storage, id.to_string(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn only_one_instance_wins_a_clean_lease() {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;

        let a = manager(storage.clone(), "instance-a");
        let b = manager(storage.clone(), "instance-b");

        let a_won = a.try_acquire().await.unwrap();
        let b_won = b.try_acquire().await.unwrap();

        assert!(a_won);
        assert!(!b_won);
        assert!(a.is_holder().await.unwrap());
        assert!(!b.is_holder().await.unwrap());
    }

    #[tokio::test]
    async fn holder_renews_and_non_holder_cannot() {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;

        let a = manager(storage.clone(), "instance-a");
        let b = manager(storage.clone(), "instance-b");

        assert!(a.try_acquire().await.unwrap());
        assert!(a.renew().await.unwrap());
        assert!(!b.renew().await.unwrap());
    }

    #[tokio::test]
    async fn released_lease_is_up_for_grabs() {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;

        let a = manager(storage.clone(), "instance-a");
        let b = manager(storage.clone(), "instance-b");

        assert!(a.try_acquire().await.unwrap());
        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.is_holder().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;

        // A zero-TTL lease expires immediately.
        let a = LeaseManager::new(storage.clone(), "instance-a".to_string(), Duration::ZERO);
        let b = manager(storage.clone(), "instance-b");

        assert!(a.try_acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!a.is_holder().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
        assert!(b.is_holder().await.unwrap());
    }
}
