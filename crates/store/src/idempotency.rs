//! Idempotency records keyed by message id. Converts the queue's
//! at-least-once delivery into at most one business effect per message.

use crate::{AtomicStore, ClaimOutcome};
use dispatch_core::config::AppConfig;
use dispatch_core::DispatchResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of `begin_processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This owner may attempt delivery.
    Acquired,
    /// The message was already delivered; the queue item is a duplicate.
    AlreadyDone,
    /// Another owner holds an unexpired processing record.
    InProgress { retry_after: Duration },
}

impl Claim {
    pub fn acquired(&self) -> bool {
        matches!(self, Claim::Acquired)
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn AtomicStore>,
    prefix: String,
    owner: String,
    processing_ttl: Duration,
    done_ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(
        store: Arc<dyn AtomicStore>,
        prefix: impl Into<String>,
        processing_ttl: Duration,
        done_ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            owner: "anonymous".to_string(),
            processing_ttl,
            done_ttl,
        }
    }

    pub fn from_config(store: Arc<dyn AtomicStore>, config: &AppConfig) -> Self {
        Self::new(
            store,
            config.redis.key_prefix.clone(),
            config.processing_ttl(),
            Duration::from_secs(config.idempotency.done_ttl_secs),
        )
    }

    /// Same store, claims recorded under `owner`.
    pub fn with_owner(&self, owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..self.clone()
        }
    }

    fn key(&self, message_id: &str) -> String {
        format!("{}:idem:{}", self.prefix, message_id)
    }

    /// Atomically create a processing record unless a live one or a done
    /// record exists.
    pub async fn begin_processing(&self, message_id: &str) -> DispatchResult<Claim> {
        let outcome = self
            .store
            .try_claim(&self.key(message_id), &self.owner, self.processing_ttl)
            .await?;
        let claim = match outcome {
            ClaimOutcome::Acquired => Claim::Acquired,
            ClaimOutcome::Completed => Claim::AlreadyDone,
            ClaimOutcome::Held { remaining } => Claim::InProgress {
                retry_after: remaining,
            },
        };
        debug!(message_id = message_id, owner = %self.owner, claim = ?claim, "Idempotency check");
        Ok(claim)
    }

    /// Record a successful delivery. The record is kept for the done TTL to
    /// absorb late duplicate deliveries.
    pub async fn mark_done(&self, message_id: &str) -> DispatchResult<()> {
        self.store.complete_claim(&self.key(message_id), self.done_ttl).await
    }

    /// Give up this owner's processing record so the message can be retried.
    pub async fn release(&self, message_id: &str) -> DispatchResult<bool> {
        self.store.release_claim(&self.key(message_id), &self.owner).await
    }

    pub fn processing_ttl(&self) -> Duration {
        self.processing_ttl
    }
}
