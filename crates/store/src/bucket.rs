//! Token bucket arithmetic shared by every store backend. The Redis script
//! in `client.rs` is a line-for-line transcription of `consume`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static parameters of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Burst allowance; a fresh bucket starts full.
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Idle period after which the stored state may be dropped.
    pub idle_ttl: Duration,
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Zero when allowed.
    pub retry_after_ms: u64,
    pub tokens_remaining: f64,
}

impl BucketState {
    pub fn full(params: &BucketParams, now_ms: i64) -> Self {
        Self {
            tokens: params.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Tokens available at `now_ms`. A clock that moved backwards adds nothing.
    pub fn refilled(&self, params: &BucketParams, now_ms: i64) -> f64 {
        let elapsed_ms = (now_ms - self.last_refill_ms).max(0) as f64;
        (self.tokens + elapsed_ms / 1000.0 * params.refill_per_sec).min(params.capacity)
    }
}

/// Refill, then try to take `cost` tokens.
///
/// Returns the outcome and, when allowed, the state to commit. A denial
/// commits nothing: the stored state already yields the same refill on the
/// next call.
pub fn consume(
    state: Option<BucketState>,
    params: &BucketParams,
    now_ms: i64,
    cost: f64,
) -> (BucketOutcome, Option<BucketState>) {
    let state = state.unwrap_or_else(|| BucketState::full(params, now_ms));
    let tokens = state.refilled(params, now_ms);

    if tokens >= cost {
        let remaining = tokens - cost;
        let committed = BucketState {
            tokens: remaining,
            last_refill_ms: now_ms.max(state.last_refill_ms),
        };
        (
            BucketOutcome {
                allowed: true,
                retry_after_ms: 0,
                tokens_remaining: remaining,
            },
            Some(committed),
        )
    } else {
        let deficit = cost - tokens;
        let retry_after_ms = (deficit / params.refill_per_sec * 1000.0).ceil().max(1.0) as u64;
        (
            BucketOutcome {
                allowed: false,
                retry_after_ms,
                tokens_remaining: tokens,
            },
            None,
        )
    }
}
