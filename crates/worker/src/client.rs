//! External messaging API client.

use async_trait::async_trait;
use dispatch_core::config::DeliveryConfig;
use dispatch_core::{DispatchError, DispatchResult, OutboundMessage};
use serde::Serialize;
use tracing::debug;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// A failed send as reported by the external API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {detail}")]
pub struct DeliveryFailure {
    pub code: String,
    pub detail: String,
    /// Timeouts, throttling, server and network errors.
    pub retryable: bool,
}

impl DeliveryFailure {
    pub fn transient(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
            retryable: false,
        }
    }
}

impl From<DeliveryFailure> for DispatchError {
    fn from(f: DeliveryFailure) -> Self {
        if f.retryable {
            DispatchError::TransientDelivery {
                code: f.code,
                detail: f.detail,
            }
        } else {
            DispatchError::PermanentDelivery {
                code: f.code,
                detail: f.detail,
            }
        }
    }
}

/// Sends one message to its recipient. `message_id` doubles as the
/// idempotency key forwarded to the provider.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryFailure>;
}

#[derive(Serialize)]
struct DeliverBody<'a> {
    message_id: &'a str,
    sender_identity: &'a str,
    recipient_id: &'a str,
    payload: &'a serde_json::Value,
}

/// JSON-over-HTTP delivery client.
pub struct HttpDeliveryClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpDeliveryClient {
    pub fn new(config: &DeliveryConfig) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DispatchError::Config(format!("delivery client: {e}")))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }
}

/// Map an HTTP status from the delivery API to success or a classified failure.
pub fn classify_status(status: u16, body: &str) -> Result<(), DeliveryFailure> {
    let code = format!("http_{status}");
    let detail: String = body.chars().take(512).collect();
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(DeliveryFailure::transient(code, detail)),
        _ => Err(DeliveryFailure::permanent(code, detail)),
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryFailure> {
        let body = DeliverBody {
            message_id: &message.message_id,
            sender_identity: &message.sender_identity,
            recipient_id: &message.recipient_id,
            payload: &message.payload,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header(IDEMPOTENCY_KEY_HEADER, &message.message_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() { "timeout" } else { "network" };
                DeliveryFailure::transient(code, e.to_string())
            })?;

        let status = response.status().as_u16();
        debug!(message_id = %message.message_id, status, "Delivery API responded");
        if response.status().is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        classify_status(status, &text)
    }
}
