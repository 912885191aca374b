//! Shared key-value state for the dispatch engine: token buckets,
//! idempotency records and per-sender leases.
//!
//! Every mutation is a single atomic operation against the backend. Redis
//! runs each operation as a server-side script; the local backend holds the
//! key's map entry exclusively for the whole read-modify-write.

#![warn(clippy::unwrap_used)]

pub mod bucket;
pub mod client;
pub mod idempotency;
pub mod lease;
pub mod local;

use async_trait::async_trait;
use dispatch_core::DispatchResult;
use std::time::Duration;

pub use bucket::{BucketOutcome, BucketParams, BucketState};
pub use client::RedisStore;
pub use idempotency::{Claim, IdempotencyStore};
pub use lease::SenderLease;
pub use local::LocalStore;

/// Result of trying to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the key until it expires or is released.
    Acquired,
    /// The key was completed and is retained as a tombstone.
    Completed,
    /// Another owner holds the key for at least `remaining`.
    Held { remaining: Duration },
}

/// Atomic primitives the dispatch engine needs from its shared store.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Refill and consume `cost` tokens from the bucket at `key` in one step.
    async fn consume_tokens(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
        cost: f64,
    ) -> DispatchResult<BucketOutcome>;

    /// Tokens available at `now_ms` without consuming any.
    async fn peek_tokens(&self, key: &str, params: &BucketParams, now_ms: i64) -> DispatchResult<f64>;

    /// Create a claim on `key` for `owner` unless a live claim or tombstone exists.
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> DispatchResult<ClaimOutcome>;

    /// Replace whatever is at `key` with a completion tombstone.
    async fn complete_claim(&self, key: &str, ttl: Duration) -> DispatchResult<()>;

    /// Drop the claim at `key` if `owner` still holds it. Returns whether
    /// anything was removed.
    async fn release_claim(&self, key: &str, owner: &str) -> DispatchResult<bool>;

    /// Liveness check.
    async fn ping(&self) -> DispatchResult<()>;
}
