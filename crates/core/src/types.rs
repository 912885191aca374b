use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lifecycle of an outbound message. `Delivered` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    InFlight,
    Delivered,
    Failed,
    DeadLettered,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::DeadLettered)
    }
}

/// A message destined for the external messaging API.
///
/// The copy held by the delivery queue is authoritative; only the dispatch
/// worker mutates `status`, `attempt_count` and `failure_history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct OutboundMessage {
    /// Idempotency key for the whole pipeline.
    pub message_id: String,
    /// Rate-limit partition key.
    pub sender_identity: String,
    pub recipient_id: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Advisory ordering hint, 1–10.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: MessageStatus,
    #[serde(default)]
    pub failure_history: Vec<FailureRecord>,
}

impl OutboundMessage {
    pub fn new(
        message_id: String,
        sender_identity: String,
        recipient_id: String,
        payload: serde_json::Value,
        priority: u8,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            sender_identity,
            recipient_id,
            payload,
            priority,
            enqueued_at,
            attempt_count: 0,
            status: MessageStatus::Queued,
            failure_history: Vec::new(),
        }
    }

    /// Record a failed attempt. `attempt_count` must already include it.
    pub fn record_failure(
        &mut self,
        class: FailureClass,
        code: impl Into<String>,
        detail: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.failure_history.push(FailureRecord {
            attempt: self.attempt_count,
            at,
            class,
            code: code.into(),
            detail: detail.into(),
        });
        self.status = MessageStatus::Failed;
    }

    /// Reset bookkeeping for an operator replay out of the dead-letter queue.
    pub fn reset_for_replay(&mut self) {
        self.attempt_count = 0;
        self.status = MessageStatus::Queued;
        self.failure_history.clear();
    }
}

/// How a delivery failure was classified.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout, 5xx, network. Retried with backoff.
    Transient,
    /// Malformed payload, recipient rejected. Dead-lettered immediately.
    Permanent,
    /// The queue redelivered the item more times than it allows.
    ReceiveLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FailureRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub class: FailureClass,
    pub code: String,
    pub detail: String,
}

/// A message parked in the dead-letter queue awaiting replay or purge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeadLetterEntry {
    pub message: OutboundMessage,
    pub failure_history: Vec<FailureRecord>,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(mut message: OutboundMessage, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        message.status = MessageStatus::DeadLettered;
        Self {
            failure_history: message.failure_history.clone(),
            message,
            dead_lettered_at: at,
            reason: reason.into(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }
}

// ─── Producer-facing types ──────────────────────────────────────────────────

/// Producer request to send one message. Every field is optional on the
/// wire so a malformed batch item is reported individually instead of
/// failing the whole request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_identity: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct SendReceipt {
    pub message_id: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct BatchItemError {
    pub error: String,
    pub message: String,
}

/// Outcome for one input index of a batch send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct BatchItemResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SendReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchItemError>,
}

impl BatchItemResult {
    pub fn is_success(&self) -> bool {
        self.receipt.is_some()
    }
}

/// Raw counts reported by a delivery queue backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct QueueStats {
    /// Messages waiting to be received (visible or delayed).
    pub depth: u64,
    /// Messages received and not yet acked.
    pub in_flight: u64,
    pub dead_letter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct QueueStatus {
    pub depth: u64,
    pub in_flight_count: u64,
    pub dead_letter_count: u64,
    /// Enqueue-to-delivery latency percentiles over the recent window.
    pub p50_latency_ms: Option<u64>,
    pub p99_latency_ms: Option<u64>,
}
