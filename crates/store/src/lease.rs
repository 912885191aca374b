//! Per-sender lease: a short-TTL claim that keeps at most one delivery
//! attempt in flight per sender identity across the whole worker pool.

use crate::{AtomicStore, ClaimOutcome};
use dispatch_core::config::AppConfig;
use dispatch_core::DispatchResult;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct SenderLease {
    store: Arc<dyn AtomicStore>,
    prefix: String,
    owner: String,
    ttl: Duration,
}

impl SenderLease {
    pub fn new(store: Arc<dyn AtomicStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            owner: "anonymous".to_string(),
            ttl,
        }
    }

    pub fn from_config(store: Arc<dyn AtomicStore>, config: &AppConfig) -> Self {
        Self::new(store, config.redis.key_prefix.clone(), config.lease_ttl())
    }

    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..self.clone()
        }
    }

    fn key(&self, sender_identity: &str) -> String {
        format!("{}:lease:{}", self.prefix, sender_identity)
    }

    /// Try to take the lease. Returns `None` once held by this owner,
    /// otherwise the time left on the current holder's lease.
    pub async fn acquire(&self, sender_identity: &str) -> DispatchResult<Option<Duration>> {
        let outcome = self
            .store
            .try_claim(&self.key(sender_identity), &self.owner, self.ttl)
            .await?;
        Ok(match outcome {
            ClaimOutcome::Acquired => None,
            ClaimOutcome::Held { remaining } => Some(remaining),
            // Leases are never completed; treat a stray tombstone as busy.
            ClaimOutcome::Completed => Some(self.ttl),
        })
    }

    pub async fn release(&self, sender_identity: &str) -> DispatchResult<bool> {
        self.store.release_claim(&self.key(sender_identity), &self.owner).await
    }
}
