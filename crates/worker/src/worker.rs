//! Dispatch worker: a Tokio task that long-polls the delivery queue and
//! drives each received message through lease, rate limit, idempotency
//! claim and the external call.

use crate::backoff::BackoffPolicy;
use crate::client::DeliveryClient;
use crate::stats::DeliveryStats;
use dispatch_core::config::AppConfig;
use dispatch_core::{
    Clock, DeadLetterEntry, DispatchError, DispatchResult, FailureClass, MessageStatus, OutboundMessage,
};
use dispatch_limiter::TokenBucketLimiter;
use dispatch_queue::{AckToken, Delivery, DeliveryQueue};
use dispatch_store::{Claim, IdempotencyStore, SenderLease};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub delivery_timeout: Duration,
    pub poll_wait: Duration,
    pub poll_batch_size: usize,
    pub lease_retry: Duration,
    pub infra_backoff: Duration,
    /// Receipt time an item must have left to be processed.
    pub receipt_budget: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.worker.max_attempts.max(1),
            backoff: BackoffPolicy::from_config(&config.worker),
            delivery_timeout: config.delivery.timeout(),
            poll_wait: config.queue.poll_wait(),
            poll_batch_size: config.queue.poll_batch_size.max(1),
            lease_retry: Duration::from_millis(config.worker.lease_retry_ms),
            infra_backoff: Duration::from_millis(config.worker.infra_backoff_ms),
            receipt_budget: config.receipt_budget(),
        }
    }
}

/// Everything a worker shares with the rest of the pool.
pub struct WorkerContext {
    pub queue: Arc<dyn DeliveryQueue>,
    pub limiter: Arc<TokenBucketLimiter>,
    pub idempotency: IdempotencyStore,
    pub lease: SenderLease,
    pub client: Arc<dyn DeliveryClient>,
    pub stats: Arc<DeliveryStats>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
}

/// What happened to one received queue item.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Delivered,
    /// Too little receipt time left for one external call; handed back
    /// to the queue untouched.
    Released,
    /// Already delivered earlier; the redelivery was acked.
    Duplicate,
    /// Another worker holds the sender lease.
    SenderBusy { retry_after: Duration },
    RateLimited { retry_after: Duration },
    /// Another owner holds a live processing claim on this message.
    ClaimHeld { retry_after: Duration },
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered { class: FailureClass },
}

pub struct DispatchWorker {
    pub worker_id: String,
    ctx: Arc<WorkerContext>,
    idempotency: IdempotencyStore,
    lease: SenderLease,
}

impl DispatchWorker {
    pub fn new(worker_id: impl Into<String>, ctx: Arc<WorkerContext>) -> Self {
        let worker_id = worker_id.into();
        Self {
            idempotency: ctx.idempotency.with_owner(worker_id.clone()),
            lease: ctx.lease.with_owner(worker_id.clone()),
            worker_id,
            ctx,
        }
    }

    /// Spawn this worker as a Tokio task that runs until `shutdown` flips.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Dispatch worker started");
        let settings = &self.ctx.settings;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Only the poll is cancelled on shutdown; an item in hand is
            // always settled.
            let polled = tokio::select! {
                polled = self.ctx.queue.poll(settings.poll_wait, settings.poll_batch_size) => polled,
                _ = shutdown.changed() => break,
            };

            let result = match polled {
                Ok(deliveries) => self.process_batch(deliveries).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(worker_id = %self.worker_id, error = %e, "Worker iteration failed, backing off");
                metrics::counter!("dispatch.worker_errors").increment(1);
                tokio::select! {
                    _ = tokio::time::sleep(settings.infra_backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        info!(worker_id = %self.worker_id, "Dispatch worker stopped");
    }

    /// One poll-and-process cycle.
    pub async fn run_once(&self) -> DispatchResult<Vec<ProcessOutcome>> {
        let settings = &self.ctx.settings;
        let deliveries = self
            .ctx
            .queue
            .poll(settings.poll_wait, settings.poll_batch_size)
            .await?;
        self.process_batch(deliveries).await
    }

    /// Process items in order. Stops at the first infrastructure error;
    /// unprocessed items are left alone and reappear after their
    /// visibility timeout.
    async fn process_batch(&self, deliveries: Vec<Delivery>) -> DispatchResult<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            outcomes.push(self.process(delivery).await?);
        }
        Ok(outcomes)
    }

    pub async fn process(&self, delivery: Delivery) -> DispatchResult<ProcessOutcome> {
        // Earlier items of the batch may have used up this receipt. Past
        // its deadline another worker can receive the item, and a stale
        // requeue would drop the attempt bookkeeping.
        let remaining = delivery.receipt_remaining(self.ctx.clock.now());
        if remaining <= self.ctx.settings.receipt_budget {
            self.ctx.queue.nack(&delivery.token, Duration::ZERO).await?;
            metrics::counter!("dispatch.receipts_released").increment(1);
            debug!(
                worker_id = %self.worker_id,
                message_id = %delivery.message.message_id,
                remaining_ms = remaining.as_millis() as u64,
                "Receipt too short for a delivery, released"
            );
            return Ok(ProcessOutcome::Released);
        }

        let Delivery {
            mut message,
            token,
            receive_count,
            ..
        } = delivery;
        let sender = message.sender_identity.clone();

        debug!(
            worker_id = %self.worker_id,
            message_id = %message.message_id,
            sender_identity = %sender,
            receive_count,
            "Processing message"
        );

        if let Some(held_for) = self.lease.acquire(&sender).await? {
            let retry_after = self.ctx.settings.lease_retry;
            self.ctx.queue.nack(&token, retry_after).await?;
            metrics::counter!("dispatch.sender_busy").increment(1);
            debug!(
                message_id = %message.message_id,
                sender_identity = %sender,
                held_for_ms = held_for.as_millis() as u64,
                "Sender lease held elsewhere"
            );
            return Ok(ProcessOutcome::SenderBusy { retry_after });
        }

        let outcome = self.process_leased(&mut message, &token).await;

        if let Err(e) = self.lease.release(&sender).await {
            // The lease TTL reclaims it.
            warn!(worker_id = %self.worker_id, sender_identity = %sender, error = %e, "Failed to release sender lease");
        }
        outcome
    }

    async fn process_leased(&self, message: &mut OutboundMessage, token: &AckToken) -> DispatchResult<ProcessOutcome> {
        let ctx = &self.ctx;

        match ctx.limiter.acquire(&message.sender_identity).await {
            Ok(_) => {}
            Err(DispatchError::RateLimited { retry_after }) => {
                ctx.queue.nack(token, retry_after).await?;
                metrics::counter!("dispatch.rate_limited").increment(1);
                debug!(
                    message_id = %message.message_id,
                    sender_identity = %message.sender_identity,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limited, deferring"
                );
                return Ok(ProcessOutcome::RateLimited { retry_after });
            }
            Err(e) => return Err(e),
        }

        match self.idempotency.begin_processing(&message.message_id).await? {
            Claim::Acquired => {}
            Claim::AlreadyDone => {
                ctx.queue.ack(token).await?;
                metrics::counter!("dispatch.duplicates").increment(1);
                info!(message_id = %message.message_id, "Duplicate delivery of completed message acked");
                return Ok(ProcessOutcome::Duplicate);
            }
            Claim::InProgress { retry_after } => {
                ctx.queue.nack(token, retry_after).await?;
                metrics::counter!("dispatch.claim_held").increment(1);
                debug!(
                    message_id = %message.message_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Message claimed by another owner"
                );
                return Ok(ProcessOutcome::ClaimHeld { retry_after });
            }
        }

        message.attempt_count += 1;
        message.status = MessageStatus::InFlight;
        let timeout = ctx.settings.delivery_timeout;
        let result = match tokio::time::timeout(timeout, ctx.client.deliver(message)).await {
            Ok(result) => result.map_err(DispatchError::from),
            Err(_) => Err(DispatchError::TransientDelivery {
                code: "timeout".to_string(),
                detail: format!("no response within {}ms", timeout.as_millis()),
            }),
        };

        match result {
            Ok(()) => self.on_delivered(message, token).await,
            Err(err) => {
                let settled = self.on_failed(message, token, err).await;
                if let Err(e) = self.idempotency.release(&message.message_id).await {
                    // Expires with the processing TTL.
                    warn!(message_id = %message.message_id, error = %e, "Failed to release processing claim");
                }
                settled
            }
        }
    }

    async fn on_delivered(&self, message: &mut OutboundMessage, token: &AckToken) -> DispatchResult<ProcessOutcome> {
        let ctx = &self.ctx;
        message.status = MessageStatus::Delivered;

        // The send already happened; ack even without a Done record.
        if let Err(e) = self.idempotency.mark_done(&message.message_id).await {
            error!(message_id = %message.message_id, error = %e, "Failed to record completed delivery");
        }
        ctx.queue.ack(token).await?;

        let latency = (ctx.clock.now() - message.enqueued_at)
            .to_std()
            .unwrap_or_default();
        ctx.stats.record(latency);
        metrics::counter!("dispatch.delivered").increment(1);
        info!(
            worker_id = %self.worker_id,
            message_id = %message.message_id,
            sender_identity = %message.sender_identity,
            attempt = message.attempt_count,
            latency_ms = latency.as_millis() as u64,
            "Message delivered"
        );
        Ok(ProcessOutcome::Delivered)
    }

    async fn on_failed(
        &self,
        message: &mut OutboundMessage,
        token: &AckToken,
        err: DispatchError,
    ) -> DispatchResult<ProcessOutcome> {
        let ctx = &self.ctx;
        let now = ctx.clock.now();
        let retryable = err.is_retryable();
        let class = if retryable {
            FailureClass::Transient
        } else {
            FailureClass::Permanent
        };
        let (code, detail) = match &err {
            DispatchError::TransientDelivery { code, detail } | DispatchError::PermanentDelivery { code, detail } => {
                (code.clone(), detail.clone())
            }
            other => (other.code().to_string(), other.to_string()),
        };
        message.record_failure(class, code.clone(), detail, now);

        let attempt = message.attempt_count;
        if retryable && attempt < ctx.settings.max_attempts {
            let delay = ctx.settings.backoff.delay(attempt);
            ctx.queue.requeue(token, message, delay).await?;
            metrics::counter!("dispatch.retries").increment(1);
            warn!(
                message_id = %message.message_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Delivery failed, retry scheduled"
            );
            return Ok(ProcessOutcome::RetryScheduled { attempt, delay });
        }

        let reason = if retryable {
            format!("gave up after {attempt} attempts: {code}")
        } else {
            format!("permanent failure: {code}")
        };
        let entry = DeadLetterEntry::new(message.clone(), reason, now);
        ctx.queue.send_to_dead_letter(token, entry).await?;
        message.status = MessageStatus::DeadLettered;

        metrics::counter!("dispatch.dead_lettered").increment(1);
        error!(
            message_id = %message.message_id,
            sender_identity = %message.sender_identity,
            attempt,
            error = %err,
            "Message dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered { class })
    }
}
