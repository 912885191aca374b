use crate::validation::build_message;
use dispatch_core::config::AdmissionConfig;
use dispatch_core::{
    BatchItemError, BatchItemResult, Clock, DeadLetterEntry, DispatchError, DispatchResult, QueueStatus,
    SendReceipt, SendRequest,
};
use dispatch_queue::DeliveryQueue;
use dispatch_worker::DeliveryStats;
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point for producers and operators. Never talks to the external
/// API; everything it accepts goes through the delivery queue.
pub struct QueueAdmissionService {
    queue: Arc<dyn DeliveryQueue>,
    stats: Arc<DeliveryStats>,
    clock: Arc<dyn Clock>,
    limits: AdmissionConfig,
}

impl QueueAdmissionService {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        stats: Arc<DeliveryStats>,
        clock: Arc<dyn Clock>,
        limits: AdmissionConfig,
    ) -> Self {
        Self {
            queue,
            stats,
            clock,
            limits,
        }
    }

    /// Validate and enqueue one message.
    pub async fn send(&self, request: &SendRequest) -> DispatchResult<SendReceipt> {
        let message = match build_message(request, &self.limits, self.clock.now()) {
            Ok(m) => m,
            Err(e) => {
                metrics::counter!("admission.rejected", "reason" => e.code()).increment(1);
                return Err(e);
            }
        };

        let receipt = self.queue.enqueue(&message).await?;
        metrics::counter!("admission.accepted").increment(1);
        info!(
            message_id = %receipt.message_id,
            sender_identity = %message.sender_identity,
            priority = message.priority,
            "Message admitted"
        );
        Ok(receipt)
    }

    /// Validate and enqueue each item independently. The batch as a whole is
    /// rejected only when it is empty or over the size limit.
    pub async fn send_batch(&self, requests: &[SendRequest]) -> DispatchResult<Vec<BatchItemResult>> {
        if requests.is_empty() {
            return Err(DispatchError::Validation("batch must contain at least one message".into()));
        }
        if requests.len() > self.limits.max_batch_size {
            return Err(DispatchError::Validation(format!(
                "batch of {} exceeds maximum of {}",
                requests.len(),
                self.limits.max_batch_size
            )));
        }

        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let result = match self.send(request).await {
                Ok(receipt) => BatchItemResult {
                    index,
                    receipt: Some(receipt),
                    error: None,
                },
                Err(e) => {
                    warn!(index, error = %e, "Batch item rejected");
                    BatchItemResult {
                        index,
                        receipt: None,
                        error: Some(BatchItemError {
                            error: e.code().to_string(),
                            message: e.to_string(),
                        }),
                    }
                }
            };
            results.push(result);
        }

        let accepted = results.iter().filter(|r| r.is_success()).count();
        metrics::counter!("admission.batches").increment(1);
        info!(total = results.len(), accepted, "Batch admitted");
        Ok(results)
    }

    pub async fn get_queue_status(&self) -> DispatchResult<QueueStatus> {
        let stats = self.queue.stats().await?;
        Ok(QueueStatus {
            depth: stats.depth,
            in_flight_count: stats.in_flight,
            dead_letter_count: stats.dead_letter,
            p50_latency_ms: self.stats.p50(),
            p99_latency_ms: self.stats.p99(),
        })
    }

    pub async fn list_dead_lettered(&self) -> DispatchResult<Vec<DeadLetterEntry>> {
        self.queue.list_dead_lettered().await
    }

    /// Put a dead-lettered message back on the queue with fresh attempts.
    pub async fn replay(&self, message_id: &str) -> DispatchResult<SendReceipt> {
        let receipt = self.queue.replay(message_id).await?;
        metrics::counter!("admission.replayed").increment(1);
        info!(message_id = message_id, "Dead letter replayed by operator");
        Ok(receipt)
    }

    pub async fn purge(&self, message_id: &str) -> DispatchResult<()> {
        self.queue.purge_dead_letter(message_id).await?;
        metrics::counter!("admission.purged").increment(1);
        info!(message_id = message_id, "Dead letter purged by operator");
        Ok(())
    }
}
