//! In-process delivery queue with the same visibility and dead-letter
//! semantics as the durable backend. Used by tests and single-node runs.

use crate::{AckToken, Delivery, DeliveryQueue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{
    Clock, DeadLetterEntry, DispatchError, DispatchResult, FailureClass, MessageStatus, OutboundMessage,
    QueueStats, SendReceipt,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Longest a waiting poll sleeps before re-checking delayed items.
const POLL_RECHECK: Duration = Duration::from_millis(50);

struct Pending {
    message: OutboundMessage,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    /// Receipts that lapsed without being settled.
    abandoned: u32,
    seq: u64,
}

struct InFlight {
    message: OutboundMessage,
    invisible_until: DateTime<Utc>,
    receive_count: u32,
    abandoned: u32,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    in_flight: HashMap<AckToken, InFlight>,
    dead_letters: HashMap<String, DeadLetterEntry>,
    next_seq: u64,
}

impl QueueState {
    fn contains_live(&self, message_id: &str) -> bool {
        self.pending.iter().any(|p| p.message.message_id == message_id)
            || self.in_flight.values().any(|f| f.message.message_id == message_id)
    }

    fn push(
        &mut self,
        message: OutboundMessage,
        visible_at: DateTime<Utc>,
        receive_count: u32,
        abandoned: u32,
        seq: Option<u64>,
    ) {
        let seq = seq.unwrap_or_else(|| {
            self.next_seq += 1;
            self.next_seq
        });
        // Keep FIFO by sequence so requeued items go back to their original place.
        let at = self.pending.iter().position(|p| p.seq > seq).unwrap_or(self.pending.len());
        self.pending.insert(
            at,
            Pending {
                message,
                visible_at,
                receive_count,
                abandoned,
                seq,
            },
        );
    }

    /// Items whose visibility timeout lapsed become receivable again.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<AckToken> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.invisible_until <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(flight) = self.in_flight.remove(&token) {
                debug!(message_id = %flight.message.message_id, "Visibility timeout lapsed");
                self.push(
                    flight.message,
                    now,
                    flight.receive_count,
                    flight.abandoned + 1,
                    Some(flight.seq),
                );
            }
        }
    }
}

pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
    max_receive_count: u32,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration, max_receive_count: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            clock,
            visibility_timeout,
            max_receive_count: max_receive_count.max(1),
        }
    }

    fn at(&self, delay: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    fn receive_visible(&self, max_messages: usize) -> Vec<Delivery> {
        let now = self.clock.now();
        let invisible_until = self.at(self.visibility_timeout);
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        let mut out = Vec::new();
        let mut idx = 0;
        while idx < state.pending.len() && out.len() < max_messages {
            if state.pending[idx].visible_at > now {
                idx += 1;
                continue;
            }
            let Some(item) = state.pending.remove(idx) else {
                break;
            };

            if item.abandoned >= self.max_receive_count {
                let mut message = item.message;
                message.record_failure(
                    FailureClass::ReceiveLimit,
                    "max_receive_count",
                    format!("receipt lapsed {} times", item.abandoned),
                    now,
                );
                warn!(message_id = %message.message_id, "Receive limit reached, dead-lettering");
                metrics::counter!("queue.receive_limit_dead_lettered").increment(1);
                let entry = DeadLetterEntry::new(message, "max receive count exceeded", now);
                state.dead_letters.insert(entry.message_id().to_string(), entry);
                continue;
            }

            let token = AckToken::new();
            let receive_count = item.receive_count + 1;
            let mut message = item.message;
            message.status = MessageStatus::InFlight;
            state.in_flight.insert(
                token.clone(),
                InFlight {
                    message: message.clone(),
                    invisible_until,
                    receive_count,
                    abandoned: item.abandoned,
                    seq: item.seq,
                },
            );
            out.push(Delivery {
                message,
                token,
                receive_count,
                receipt_deadline: invisible_until,
            });
        }
        out
    }
}

#[async_trait]
impl DeliveryQueue for MemoryQueue {
    async fn enqueue(&self, message: &OutboundMessage) -> DispatchResult<SendReceipt> {
        let receipt = SendReceipt {
            message_id: message.message_id.clone(),
            queued_at: message.enqueued_at,
        };
        {
            let mut state = self.state.lock();
            if state.contains_live(&message.message_id) {
                // Producer retry of a message we already hold.
                debug!(message_id = %message.message_id, "Duplicate enqueue ignored");
                return Ok(receipt);
            }
            let now = self.clock.now();
            state.push(message.clone(), now, 0, 0, None);
        }
        metrics::counter!("queue.enqueued").increment(1);
        self.notify.notify_waiters();
        Ok(receipt)
    }

    async fn poll(&self, max_wait: Duration, max_messages: usize) -> DispatchResult<Vec<Delivery>> {
        let max_messages = max_messages.max(1);
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.receive_visible(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let nap = (deadline - now).min(POLL_RECHECK);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, token: &AckToken) -> DispatchResult<()> {
        if self.state.lock().in_flight.remove(token).is_none() {
            warn!(token = %token, "Ack for stale receipt ignored");
        }
        Ok(())
    }

    async fn nack(&self, token: &AckToken, delay: Duration) -> DispatchResult<()> {
        let visible_at = self.at(delay);
        {
            let mut state = self.state.lock();
            match state.in_flight.remove(token) {
                Some(flight) => {
                    let mut message = flight.message;
                    message.status = MessageStatus::Queued;
                    state.push(message, visible_at, flight.receive_count, flight.abandoned, Some(flight.seq));
                }
                None => warn!(token = %token, "Nack for stale receipt ignored"),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&self, token: &AckToken, message: &OutboundMessage, delay: Duration) -> DispatchResult<()> {
        let visible_at = self.at(delay);
        {
            let mut state = self.state.lock();
            match state.in_flight.remove(token) {
                Some(flight) => {
                    state.push(
                        message.clone(),
                        visible_at,
                        flight.receive_count,
                        flight.abandoned,
                        Some(flight.seq),
                    );
                }
                None => warn!(token = %token, message_id = %message.message_id, "Requeue for stale receipt ignored"),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn send_to_dead_letter(&self, token: &AckToken, entry: DeadLetterEntry) -> DispatchResult<()> {
        let mut state = self.state.lock();
        state.in_flight.remove(token);
        let message_id = entry.message_id().to_string();
        // A copy that reappeared after a lapsed visibility timeout must not
        // outlive its dead-letter entry.
        state.pending.retain(|p| p.message.message_id != message_id);
        state.dead_letters.insert(message_id, entry);
        Ok(())
    }

    async fn stats(&self) -> DispatchResult<QueueStats> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);
        Ok(QueueStats {
            depth: state.pending.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead_letter: state.dead_letters.len() as u64,
        })
    }

    async fn list_dead_lettered(&self) -> DispatchResult<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = self.state.lock().dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
        Ok(entries)
    }

    async fn replay(&self, message_id: &str) -> DispatchResult<SendReceipt> {
        let receipt = {
            let mut state = self.state.lock();
            let entry = state
                .dead_letters
                .remove(message_id)
                .ok_or_else(|| DispatchError::NotFound(format!("dead letter {message_id}")))?;
            let mut message = entry.message;
            message.reset_for_replay();
            let now = self.clock.now();
            let receipt = SendReceipt {
                message_id: message.message_id.clone(),
                queued_at: now,
            };
            state.push(message, now, 0, 0, None);
            receipt
        };
        metrics::counter!("queue.replayed").increment(1);
        self.notify.notify_waiters();
        Ok(receipt)
    }

    async fn purge_dead_letter(&self, message_id: &str) -> DispatchResult<()> {
        self.state
            .lock()
            .dead_letters
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| DispatchError::NotFound(format!("dead letter {message_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::ManualClock;

    fn message(id: &str) -> OutboundMessage {
        OutboundMessage::new(
            id.to_string(),
            "u1".to_string(),
            "r1".to_string(),
            serde_json::json!({"text": id}),
            5,
            Utc::now(),
        )
    }

    fn queue(max_receive_count: u32) -> (Arc<ManualClock>, MemoryQueue) {
        let clock = Arc::new(ManualClock::default());
        let queue = MemoryQueue::new(clock.clone(), Duration::from_secs(30), max_receive_count);
        (clock, queue)
    }

    #[tokio::test]
    async fn test_received_item_is_invisible_until_timeout() {
        let (clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();

        let first = queue.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.poll(Duration::ZERO, 10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(31));
        let again = queue.poll(Duration::ZERO, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);

        // The first receipt is stale now; acking it changes nothing.
        queue.ack(&first[0].token).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn test_nack_delays_visibility() {
        let (clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();
        let got = queue.poll(Duration::ZERO, 1).await.unwrap();
        queue.nack(&got[0].token, Duration::from_secs(5)).await.unwrap();

        assert!(queue.poll(Duration::ZERO, 1).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.poll(Duration::ZERO, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_replaces_authoritative_copy() {
        let (_clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();
        let got = queue.poll(Duration::ZERO, 1).await.unwrap();

        let mut updated = got[0].message.clone();
        updated.attempt_count = 1;
        queue.requeue(&got[0].token, &updated, Duration::ZERO).await.unwrap();

        let again = queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(again[0].message.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_receive_limit_moves_to_dead_letter() {
        let (clock, queue) = queue(2);
        queue.enqueue(&message("m1")).await.unwrap();
        for _ in 0..2 {
            assert_eq!(queue.poll(Duration::ZERO, 1).await.unwrap().len(), 1);
            clock.advance(Duration::from_secs(31));
        }
        assert!(queue.poll(Duration::ZERO, 1).await.unwrap().is_empty());

        let dead = queue.list_dead_lettered().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure_history[0].class, FailureClass::ReceiveLimit);
    }

    #[tokio::test]
    async fn test_settled_receipts_do_not_count_toward_limit() {
        let (clock, queue) = queue(2);
        queue.enqueue(&message("m1")).await.unwrap();
        for _ in 0..10 {
            let got = queue.poll(Duration::ZERO, 1).await.unwrap();
            assert_eq!(got.len(), 1);
            queue.nack(&got[0].token, Duration::from_secs(6)).await.unwrap();
            clock.advance(Duration::from_secs(6));
        }

        let got = queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(got[0].receive_count, 11);
        let mut updated = got[0].message.clone();
        updated.attempt_count = 1;
        queue.requeue(&got[0].token, &updated, Duration::ZERO).await.unwrap();

        assert_eq!(queue.poll(Duration::ZERO, 1).await.unwrap().len(), 1);
        assert!(queue.list_dead_lettered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_deadline_is_visibility_timeout() {
        let (clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();
        let got = queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(got[0].receipt_remaining(clock.now()), Duration::from_secs(30));

        clock.advance(Duration::from_secs(31));
        assert_eq!(got[0].receipt_remaining(clock.now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_replay_resets_and_requeues() {
        let (_clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();
        let got = queue.poll(Duration::ZERO, 1).await.unwrap();

        let mut failed = got[0].message.clone();
        failed.attempt_count = 5;
        failed.record_failure(FailureClass::Transient, "503", "unavailable", Utc::now());
        let entry = DeadLetterEntry::new(failed, "max attempts", Utc::now());
        queue.send_to_dead_letter(&got[0].token, entry).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.depth, stats.in_flight, stats.dead_letter), (0, 0, 1));

        queue.replay("m1").await.unwrap();
        let again = queue.poll(Duration::ZERO, 1).await.unwrap();
        assert_eq!(again[0].message.attempt_count, 0);
        assert!(again[0].message.failure_history.is_empty());
        assert_eq!(queue.stats().await.unwrap().dead_letter, 0);

        assert!(matches!(queue.replay("m1").await, Err(DispatchError::NotFound(_))));
        assert!(matches!(queue.purge_dead_letter("m1").await, Err(DispatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let (_clock, queue) = queue(10);
        queue.enqueue(&message("m1")).await.unwrap();
        queue.enqueue(&message("m1")).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(MemoryQueue::new(clock, Duration::from_secs(30), 10));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(5), 1).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(&message("m1")).await.unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
