//! Delivery queue abstraction: at-least-once delivery with per-item
//! visibility timeout and a companion dead-letter queue.
//!
//! Consumers must treat every polled item as a possible duplicate. The
//! receive limit only counts receipts whose visibility timeout lapsed.

#![warn(clippy::unwrap_used)]

pub mod jetstream;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{DeadLetterEntry, DispatchResult, OutboundMessage, QueueStats, SendReceipt};
use std::time::Duration;

pub use jetstream::JetStreamQueue;
pub use memory::MemoryQueue;

/// Opaque handle for one receipt of a queue item. Becomes stale once the
/// item is acked, nacked, or its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(pub String);

impl AckToken {
    pub fn new() -> Self {
        AckToken(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for AckToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One received queue item.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: OutboundMessage,
    pub token: AckToken,
    /// How many times the queue has handed this item out, including now.
    pub receive_count: u32,
    /// When the receipt lapses and the item becomes visible again.
    pub receipt_deadline: DateTime<Utc>,
}

impl Delivery {
    /// Receipt time left at `now`, zero once lapsed.
    pub fn receipt_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.receipt_deadline - now).to_std().unwrap_or_default()
    }
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, message: &OutboundMessage) -> DispatchResult<SendReceipt>;

    /// Receive up to `max_messages` visible items, waiting at most
    /// `max_wait` for the first one. Received items are hidden from other
    /// consumers until acked, nacked, or the visibility timeout lapses.
    async fn poll(&self, max_wait: Duration, max_messages: usize) -> DispatchResult<Vec<Delivery>>;

    /// Remove the item for good.
    async fn ack(&self, token: &AckToken) -> DispatchResult<()>;

    /// Return the item unchanged, visible again after `delay`.
    ///
    /// Ack, nack and requeue all settle the receipt. Only receipts that
    /// lapse unsettled count toward the receive limit, so deferring an item
    /// any number of times never dead-letters it.
    async fn nack(&self, token: &AckToken, delay: Duration) -> DispatchResult<()>;

    /// Return the item with `message` as its new authoritative copy,
    /// visible again after `delay`.
    async fn requeue(&self, token: &AckToken, message: &OutboundMessage, delay: Duration) -> DispatchResult<()>;

    /// Remove the item and park `entry` in the dead-letter queue.
    async fn send_to_dead_letter(&self, token: &AckToken, entry: DeadLetterEntry) -> DispatchResult<()>;

    async fn stats(&self) -> DispatchResult<QueueStats>;

    /// Dead-letter entries, oldest first.
    async fn list_dead_lettered(&self) -> DispatchResult<Vec<DeadLetterEntry>>;

    /// Move a dead-lettered message back into the queue with its attempt
    /// bookkeeping reset.
    async fn replay(&self, message_id: &str) -> DispatchResult<SendReceipt>;

    /// Drop a dead-lettered message permanently.
    async fn purge_dead_letter(&self, message_id: &str) -> DispatchResult<()>;
}
