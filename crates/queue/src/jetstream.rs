//! NATS JetStream adapter. The work stream gives at-least-once delivery
//! with an ack wait acting as the visibility timeout; dead letters live in
//! a JetStream key-value bucket keyed by message id.
//!
//! Stream messages are immutable and the broker counts every redelivery,
//! so nack and requeue publish a fresh delayed copy and ack the received
//! one. The broker's delivery count then only grows when a receipt lapses.

use crate::{AckToken, Delivery, DeliveryQueue};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, kv, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dispatch_core::config::{NatsConfig, QueueConfig};
use dispatch_core::{
    Clock, DeadLetterEntry, DispatchError, DispatchResult, FailureClass, MessageStatus, OutboundMessage,
    QueueStats, SendReceipt,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
pub const HEADER_SENDER: &str = "Dispatch-Sender-Identity";
pub const HEADER_PRIORITY: &str = "Dispatch-Priority";
/// Epoch milliseconds before which a requeued copy must not be processed.
pub const HEADER_NOT_BEFORE: &str = "Dispatch-Not-Before";

/// Broker-side dedup window for producer retries.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

pub struct JetStreamQueue {
    context: jetstream::Context,
    consumer: jetstream::consumer::PullConsumer,
    dead_letters: kv::Store,
    stream_name: String,
    consumer_name: String,
    subject: String,
    in_flight: DashMap<AckToken, jetstream::Message>,
    visibility_timeout: Duration,
    max_receive_count: u32,
    clock: Arc<dyn Clock>,
}

fn nats_err(e: impl std::fmt::Display) -> DispatchError {
    metrics::counter!("queue.nats.errors").increment(1);
    DispatchError::infrastructure(format!("nats: {e}"))
}

/// Headers carried by every published copy.
pub fn message_headers(message: &OutboundMessage, msg_id: &str, not_before: Option<DateTime<Utc>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HEADER_MSG_ID, msg_id);
    headers.insert(HEADER_SENDER, message.sender_identity.as_str());
    headers.insert(HEADER_PRIORITY, message.priority.to_string().as_str());
    if let Some(at) = not_before {
        headers.insert(HEADER_NOT_BEFORE, at.timestamp_millis().to_string().as_str());
    }
    headers
}

/// Dead-letter entry for a queue item whose body is not an
/// `OutboundMessage`. The raw body is kept so an operator can inspect it.
pub fn undecodable_entry(
    stream_sequence: u64,
    headers: Option<&HeaderMap>,
    raw: &[u8],
    error: &str,
    now: DateTime<Utc>,
) -> DeadLetterEntry {
    let sender = headers
        .and_then(|h| h.get(HEADER_SENDER))
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mut message = OutboundMessage::new(
        format!("undecodable-{stream_sequence}"),
        sender,
        String::new(),
        serde_json::json!({ "raw": String::from_utf8_lossy(raw) }),
        5,
        now,
    );
    message.record_failure(FailureClass::Permanent, "undecodable", error, now);
    DeadLetterEntry::new(message, "undecodable queue item", now)
}

/// Remaining delay encoded in a `Dispatch-Not-Before` header, if any.
pub fn remaining_delay(headers: Option<&HeaderMap>, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers?.get(HEADER_NOT_BEFORE)?.as_str();
    let not_before_ms: i64 = raw.parse().ok()?;
    let remaining = not_before_ms - now.timestamp_millis();
    (remaining > 0).then(|| Duration::from_millis(remaining as u64))
}

impl JetStreamQueue {
    /// Connect to NATS and ensure the work stream, consumer and
    /// dead-letter bucket exist.
    pub async fn connect(nats: &NatsConfig, queue: &QueueConfig, clock: Arc<dyn Clock>) -> DispatchResult<Self> {
        let url = nats
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        info!(url = %url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(nats.max_reconnects))
            .connect(&url)
            .await
            .map_err(nats_err)?;
        let context = jetstream::new(client);

        let subject = format!("{}.messages", nats.subject_prefix);
        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: nats.stream_name.clone(),
                subjects: vec![subject.clone()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                duplicate_window: DUPLICATE_WINDOW,
                ..Default::default()
            })
            .await
            .map_err(nats_err)?;

        let consumer = stream
            .get_or_create_consumer(
                &nats.consumer_name,
                pull::Config {
                    durable_name: Some(nats.consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: queue.visibility_timeout(),
                    // Receive limit is enforced in `admit`.
                    max_deliver: -1,
                    ..Default::default()
                },
            )
            .await
            .map_err(nats_err)?;

        let dead_letters = match context.get_key_value(&nats.dead_letter_bucket).await {
            Ok(store) => store,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: nats.dead_letter_bucket.clone(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(nats_err)?,
        };

        info!(
            stream = %nats.stream_name,
            consumer = %nats.consumer_name,
            dead_letters = %nats.dead_letter_bucket,
            "JetStream delivery queue ready"
        );

        Ok(Self {
            context,
            consumer,
            dead_letters,
            stream_name: nats.stream_name.clone(),
            consumer_name: nats.consumer_name.clone(),
            subject,
            in_flight: DashMap::new(),
            visibility_timeout: queue.visibility_timeout(),
            max_receive_count: queue.max_receive_count.max(1),
            clock,
        })
    }

    async fn publish(&self, message: &OutboundMessage, msg_id: &str, not_before: Option<DateTime<Utc>>) -> DispatchResult<()> {
        let payload = serde_json::to_vec(message)?;
        let headers = message_headers(message, msg_id, not_before);
        self.context
            .publish_with_headers(self.subject.clone(), headers, payload.into())
            .await
            .map_err(nats_err)?
            .await
            .map_err(nats_err)?;
        Ok(())
    }

    fn take(&self, token: &AckToken) -> Option<jetstream::Message> {
        self.in_flight.remove(token).map(|(_, msg)| msg)
    }

    /// Publish `message` as a fresh copy visible after `delay`, then retire
    /// the received one. A crash in between leaves a duplicate, which the
    /// idempotency store absorbs.
    async fn republish(
        &self,
        received: jetstream::Message,
        message: &OutboundMessage,
        msg_id: &str,
        delay: Duration,
    ) -> DispatchResult<()> {
        let not_before = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.publish(message, msg_id, Some(not_before)).await?;
        received.ack().await.map_err(nats_err)
    }

    async fn store_dead_letter(&self, entry: &DeadLetterEntry) -> DispatchResult<()> {
        let body = serde_json::to_vec(entry)?;
        self.dead_letters
            .put(entry.message_id(), body.into())
            .await
            .map_err(nats_err)?;
        Ok(())
    }

    async fn load_dead_letter(&self, message_id: &str) -> DispatchResult<Option<DeadLetterEntry>> {
        match self.dead_letters.get(message_id).await.map_err(nats_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Turn one raw JetStream message into a delivery, or settle it here
    /// when it is delayed, undecodable, or over its receive limit.
    async fn admit(&self, msg: jetstream::Message) -> DispatchResult<Option<Delivery>> {
        let now = self.clock.now();

        if let Some(delay) = remaining_delay(msg.headers.as_ref(), now) {
            msg.ack_with(AckKind::Nak(Some(delay))).await.map_err(nats_err)?;
            return Ok(None);
        }

        let (receive_count, stream_sequence) = msg
            .info()
            .map(|i| (i.delivered.max(1) as u32, i.stream_sequence))
            .unwrap_or((1, now.timestamp_millis().max(0) as u64));

        let mut message: OutboundMessage = match serde_json::from_slice(&msg.payload) {
            Ok(m) => m,
            Err(e) => {
                let entry = undecodable_entry(stream_sequence, msg.headers.as_ref(), &msg.payload, &e.to_string(), now);
                error!(
                    error = %e,
                    dead_letter_id = %entry.message_id(),
                    "Undecodable queue item dead-lettered"
                );
                metrics::counter!("queue.decode_errors").increment(1);
                self.store_dead_letter(&entry).await?;
                msg.ack_with(AckKind::Term).await.map_err(nats_err)?;
                return Ok(None);
            }
        };

        if receive_count > self.max_receive_count {
            message.record_failure(
                FailureClass::ReceiveLimit,
                "max_receive_count",
                format!("received {receive_count} times"),
                now,
            );
            warn!(message_id = %message.message_id, "Receive limit reached, dead-lettering");
            metrics::counter!("queue.receive_limit_dead_lettered").increment(1);
            let entry = DeadLetterEntry::new(message, "max receive count exceeded", now);
            self.store_dead_letter(&entry).await?;
            msg.ack_with(AckKind::Term).await.map_err(nats_err)?;
            return Ok(None);
        }

        message.status = MessageStatus::InFlight;
        let token = AckToken::new();
        self.in_flight.insert(token.clone(), msg);
        Ok(Some(Delivery {
            message,
            token,
            receive_count,
            receipt_deadline: now + chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::zero()),
        }))
    }
}

#[async_trait]
impl DeliveryQueue for JetStreamQueue {
    async fn enqueue(&self, message: &OutboundMessage) -> DispatchResult<SendReceipt> {
        self.publish(message, &message.message_id, None).await?;
        metrics::counter!("queue.enqueued").increment(1);
        Ok(SendReceipt {
            message_id: message.message_id.clone(),
            queued_at: message.enqueued_at,
        })
    }

    async fn poll(&self, max_wait: Duration, max_messages: usize) -> DispatchResult<Vec<Delivery>> {
        let max_messages = max_messages.max(1);
        let mut raw = Vec::new();

        let ready = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .messages()
            .await
            .map_err(nats_err)?;
        tokio::pin!(ready);
        while let Some(next) = ready.next().await {
            raw.push(next.map_err(nats_err)?);
        }

        if raw.is_empty() && !max_wait.is_zero() {
            // Long poll for the first item only so it is handed out as soon
            // as it arrives.
            let waiting = self
                .consumer
                .batch()
                .max_messages(1)
                .expires(max_wait)
                .messages()
                .await
                .map_err(nats_err)?;
            tokio::pin!(waiting);
            while let Some(next) = waiting.next().await {
                raw.push(next.map_err(nats_err)?);
            }
        }

        let mut out = Vec::with_capacity(raw.len());
        for msg in raw {
            if let Some(delivery) = self.admit(msg).await? {
                out.push(delivery);
            }
        }
        debug!(received = out.len(), "JetStream poll complete");
        Ok(out)
    }

    async fn ack(&self, token: &AckToken) -> DispatchResult<()> {
        match self.take(token) {
            Some(msg) => msg.ack().await.map_err(nats_err),
            None => {
                warn!(token = %token, "Ack for unknown receipt ignored");
                Ok(())
            }
        }
    }

    async fn nack(&self, token: &AckToken, delay: Duration) -> DispatchResult<()> {
        let Some(msg) = self.take(token) else {
            warn!(token = %token, "Nack for unknown receipt ignored");
            return Ok(());
        };
        let mut message: OutboundMessage = serde_json::from_slice(&msg.payload)?;
        message.status = MessageStatus::Queued;
        let msg_id = format!("{}#deferred-{}", message.message_id, token);
        self.republish(msg, &message, &msg_id, delay).await
    }

    async fn requeue(&self, token: &AckToken, message: &OutboundMessage, delay: Duration) -> DispatchResult<()> {
        let Some(msg) = self.take(token) else {
            warn!(token = %token, message_id = %message.message_id, "Requeue for unknown receipt ignored");
            return Ok(());
        };

        let msg_id = format!("{}#attempt-{}", message.message_id, message.attempt_count);
        self.republish(msg, message, &msg_id, delay).await
    }

    async fn send_to_dead_letter(&self, token: &AckToken, entry: DeadLetterEntry) -> DispatchResult<()> {
        self.store_dead_letter(&entry).await?;
        if let Some(msg) = self.take(token) {
            msg.ack_with(AckKind::Term).await.map_err(nats_err)?;
        }
        Ok(())
    }

    async fn stats(&self) -> DispatchResult<QueueStats> {
        let mut stream = self.context.get_stream(&self.stream_name).await.map_err(nats_err)?;
        let stored = stream.info().await.map_err(nats_err)?.state.messages;

        let mut consumer: jetstream::consumer::PullConsumer =
            stream.get_consumer(&self.consumer_name).await.map_err(nats_err)?;
        let in_flight = consumer.info().await.map_err(nats_err)?.num_ack_pending as u64;

        let mut dead_letter = 0u64;
        let keys = self.dead_letters.keys().await.map_err(nats_err)?;
        tokio::pin!(keys);
        while let Some(key) = keys.next().await {
            key.map_err(nats_err)?;
            dead_letter += 1;
        }

        Ok(QueueStats {
            depth: stored.saturating_sub(in_flight),
            in_flight,
            dead_letter,
        })
    }

    async fn list_dead_lettered(&self) -> DispatchResult<Vec<DeadLetterEntry>> {
        let mut ids = Vec::new();
        let keys = self.dead_letters.keys().await.map_err(nats_err)?;
        tokio::pin!(keys);
        while let Some(key) = keys.next().await {
            ids.push(key.map_err(nats_err)?);
        }

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.load_dead_letter(&id).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
        Ok(entries)
    }

    async fn replay(&self, message_id: &str) -> DispatchResult<SendReceipt> {
        let entry = self
            .load_dead_letter(message_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("dead letter {message_id}")))?;

        let mut message = entry.message;
        message.reset_for_replay();
        let now = self.clock.now();
        let msg_id = format!("{}#replay-{}", message.message_id, now.timestamp_millis());
        self.publish(&message, &msg_id, None).await?;
        self.dead_letters.purge(message_id).await.map_err(nats_err)?;

        metrics::counter!("queue.replayed").increment(1);
        info!(message_id = message_id, "Dead letter replayed");
        Ok(SendReceipt {
            message_id: message.message_id,
            queued_at: now,
        })
    }

    async fn purge_dead_letter(&self, message_id: &str) -> DispatchResult<()> {
        if self.load_dead_letter(message_id).await?.is_none() {
            return Err(DispatchError::NotFound(format!("dead letter {message_id}")));
        }
        self.dead_letters.purge(message_id).await.map_err(nats_err)
    }
}
