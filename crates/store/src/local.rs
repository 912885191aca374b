//! In-process store backed by DashMap. Each operation runs under the
//! key's shard lock, which gives the same atomicity a Redis script has,
//! but only within one process: use it for tests and single-node runs.

use crate::bucket::{self, BucketOutcome, BucketParams, BucketState};
use crate::{AtomicStore, ClaimOutcome};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dispatch_core::{Clock, DispatchResult};
use std::sync::Arc;
use std::time::Duration;

struct BucketEntry {
    state: BucketState,
    expires_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClaimState {
    Held { owner: String },
    Completed,
}

struct ClaimEntry {
    state: ClaimState,
    expires_at_ms: i64,
}

/// Lock-free local store for token buckets and claims.
pub struct LocalStore {
    buckets: DashMap<String, BucketEntry>,
    claims: DashMap<String, ClaimEntry>,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            claims: DashMap::new(),
            clock,
        }
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.buckets.len() + self.claims.len();
        self.buckets.retain(|_, entry| entry.expires_at_ms > now);
        self.claims.retain(|_, entry| entry.expires_at_ms > now);
        before - (self.buckets.len() + self.claims.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len() + self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.claims.is_empty()
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl AtomicStore for LocalStore {
    async fn consume_tokens(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
        cost: f64,
    ) -> DispatchResult<BucketOutcome> {
        let expires_at_ms = now_ms.saturating_add(ttl_ms(params.idle_ttl));
        let outcome = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let previous = if occupied.get().expires_at_ms > now_ms {
                    Some(occupied.get().state)
                } else {
                    None
                };
                let (outcome, commit) = bucket::consume(previous, params, now_ms, cost);
                match commit {
                    Some(state) => {
                        occupied.insert(BucketEntry {
                            state,
                            expires_at_ms,
                        });
                    }
                    None if previous.is_none() => {
                        occupied.remove();
                    }
                    None => {}
                }
                outcome
            }
            Entry::Vacant(vacant) => {
                let (outcome, commit) = bucket::consume(None, params, now_ms, cost);
                if let Some(state) = commit {
                    vacant.insert(BucketEntry {
                        state,
                        expires_at_ms,
                    });
                }
                outcome
            }
        };
        Ok(outcome)
    }

    async fn peek_tokens(&self, key: &str, params: &BucketParams, now_ms: i64) -> DispatchResult<f64> {
        let tokens = match self.buckets.get(key) {
            Some(entry) if entry.expires_at_ms > now_ms => entry.state.refilled(params, now_ms),
            _ => params.capacity,
        };
        Ok(tokens)
    }

    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> DispatchResult<ClaimOutcome> {
        let now = self.clock.now_millis();
        let fresh = ClaimEntry {
            state: ClaimState::Held {
                owner: owner.to_string(),
            },
            expires_at_ms: now.saturating_add(ttl_ms(ttl)),
        };

        let outcome = match self.claims.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.expires_at_ms <= now {
                    // Abandoned claim or stale tombstone.
                    occupied.insert(fresh);
                    ClaimOutcome::Acquired
                } else if existing.state == ClaimState::Completed {
                    ClaimOutcome::Completed
                } else {
                    let remaining = (existing.expires_at_ms - now).max(0) as u64;
                    ClaimOutcome::Held {
                        remaining: Duration::from_millis(remaining),
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                ClaimOutcome::Acquired
            }
        };
        Ok(outcome)
    }

    async fn complete_claim(&self, key: &str, ttl: Duration) -> DispatchResult<()> {
        let now = self.clock.now_millis();
        self.claims.insert(
            key.to_string(),
            ClaimEntry {
                state: ClaimState::Completed,
                expires_at_ms: now.saturating_add(ttl_ms(ttl)),
            },
        );
        Ok(())
    }

    async fn release_claim(&self, key: &str, owner: &str) -> DispatchResult<bool> {
        let removed = self
            .claims
            .remove_if(key, |_, entry| {
                matches!(&entry.state, ClaimState::Held { owner: held } if held == owner)
            })
            .is_some();
        Ok(removed)
    }

    async fn ping(&self) -> DispatchResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::ManualClock;

    fn store() -> (Arc<ManualClock>, LocalStore) {
        let clock = Arc::new(ManualClock::default());
        let store = LocalStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);

        assert_eq!(store.try_claim("k", "w1", ttl).await.unwrap(), ClaimOutcome::Acquired);
        assert!(matches!(
            store.try_claim("k", "w2", ttl).await.unwrap(),
            ClaimOutcome::Held { .. }
        ));

        clock.advance(Duration::from_secs(11));
        assert_eq!(store.try_claim("k", "w2", ttl).await.unwrap(), ClaimOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_release_requires_owner() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(10);
        store.try_claim("k", "w1", ttl).await.unwrap();

        assert!(!store.release_claim("k", "w2").await.unwrap());
        assert!(store.release_claim("k", "w1").await.unwrap());
        assert_eq!(store.try_claim("k", "w2", ttl).await.unwrap(), ClaimOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_completed_claim_is_not_released() {
        let (_clock, store) = store();
        store.try_claim("k", "w1", Duration::from_secs(10)).await.unwrap();
        store.complete_claim("k", Duration::from_secs(60)).await.unwrap();

        assert!(!store.release_claim("k", "w1").await.unwrap());
        assert_eq!(
            store.try_claim("k", "w2", Duration::from_secs(10)).await.unwrap(),
            ClaimOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_idle_bucket_expires_to_full() {
        let (clock, store) = store();
        let params = BucketParams {
            capacity: 3.0,
            refill_per_sec: 0.001,
            idle_ttl: Duration::from_secs(60),
        };
        let now = clock.now_millis();
        for _ in 0..3 {
            assert!(store.consume_tokens("b", &params, now, 1.0).await.unwrap().allowed);
        }
        assert!(!store.consume_tokens("b", &params, now, 1.0).await.unwrap().allowed);

        clock.advance(Duration::from_secs(61));
        assert_eq!(store.evict_expired(), 1);
        let later = clock.now_millis();
        assert_eq!(store.peek_tokens("b", &params, later).await.unwrap(), 3.0);
    }
}
