//! Dispatch workers: drain the delivery queue under the per-sender rate
//! limit, converting at-least-once queue delivery into at most one external
//! send per message.

#![warn(clippy::unwrap_used)]

pub mod backoff;
pub mod client;
pub mod pool;
pub mod stats;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use client::{DeliveryClient, DeliveryFailure, HttpDeliveryClient};
pub use pool::WorkerPool;
pub use stats::DeliveryStats;
pub use worker::{DispatchWorker, ProcessOutcome, WorkerContext, WorkerSettings};
