//! Token bucket rate limiting: caps sends per sender identity.

use dispatch_core::config::LimiterConfig;
use dispatch_core::{Clock, DispatchError, DispatchResult};
use dispatch_store::{AtomicStore, BucketOutcome, BucketParams};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type AcquireResult = BucketOutcome;

pub struct TokenBucketLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    params: BucketParams,
    prefix: String,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        config: &LimiterConfig,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            params: BucketParams {
                capacity: config.capacity,
                refill_per_sec: config.refill_rate_per_second(),
                idle_ttl: Duration::from_secs(config.idle_ttl_secs),
            },
            prefix: prefix.into(),
        }
    }

    fn key(&self, identity: &str) -> String {
        format!("{}:bucket:{}", self.prefix, identity)
    }

    /// Take `cost` tokens from `identity`'s bucket if available.
    pub async fn try_acquire(&self, identity: &str, cost: f64) -> DispatchResult<AcquireResult> {
        if identity.is_empty() {
            return Err(DispatchError::Validation("identity must not be empty".into()));
        }
        if !(cost > 0.0 && cost <= self.params.capacity) {
            return Err(DispatchError::Validation(format!(
                "cost {cost} must be in (0, {}]",
                self.params.capacity
            )));
        }

        let now_ms = self.clock.now_millis();
        let result = self
            .store
            .consume_tokens(&self.key(identity), &self.params, now_ms, cost)
            .await?;

        if result.allowed {
            metrics::counter!("limiter.allowed").increment(1);
        } else {
            metrics::counter!("limiter.denied").increment(1);
            debug!(
                identity = identity,
                retry_after_ms = result.retry_after_ms,
                tokens = result.tokens_remaining,
                "Rate limit denied"
            );
        }
        Ok(result)
    }

    /// Single-send shorthand.
    pub async fn try_acquire_one(&self, identity: &str) -> DispatchResult<AcquireResult> {
        self.try_acquire(identity, 1.0).await
    }

    /// Take one token or fail with `DispatchError::RateLimited` carrying
    /// the wait until the bucket can cover it.
    pub async fn acquire(&self, identity: &str) -> DispatchResult<AcquireResult> {
        let result = self.try_acquire_one(identity).await?;
        if !result.allowed {
            return Err(DispatchError::RateLimited {
                retry_after: Duration::from_millis(result.retry_after_ms),
            });
        }
        Ok(result)
    }

    /// Tokens currently available to `identity`, without consuming.
    pub async fn peek(&self, identity: &str) -> DispatchResult<f64> {
        let now_ms = self.clock.now_millis();
        self.store.peek_tokens(&self.key(identity), &self.params, now_ms).await
    }

    /// Upper bound on successful acquires in any window of this length.
    pub fn max_in_window(&self, window: Duration) -> f64 {
        self.params.capacity + self.params.refill_per_sec * window.as_secs_f64()
    }
}
