//! Per-sender token bucket limiter. The sole enforcement point for the
//! external API's rate contract, so every acquire is one atomic store call.

#![warn(clippy::unwrap_used)]

pub mod token_bucket;

pub use token_bucket::{AcquireResult, TokenBucketLimiter};
