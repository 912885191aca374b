use crate::error::{DispatchError, DispatchResult};
use serde::Deserialize;
use std::time::Duration;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DISPATCH_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Shared key-value store for limiter, idempotency and lease state.
/// When disabled, an in-process store is used (single node only).
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_dead_letter_bucket")]
    pub dead_letter_bucket: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
}

/// Token bucket parameters, one bucket per sender identity.
#[derive(Debug, Clone, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_bucket_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_per_minute")]
    pub refill_per_minute: f64,
    #[serde(default = "default_limiter_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Added to the queue visibility timeout to form the processing-claim TTL.
    #[serde(default = "default_processing_margin_secs")]
    pub processing_margin_secs: u64,
    #[serde(default = "default_done_ttl_secs")]
    pub done_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Jetstream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_backend")]
    pub backend: QueueBackend,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Abandoned receipts (visibility timeout lapsed without an ack, nack or
    /// requeue) after which the queue itself dead-letters an item.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: bool,
    /// Delay before retrying a message whose sender is leased by another worker.
    #[serde(default = "default_lease_retry_ms")]
    pub lease_retry_ms: u64,
    /// Pause after an infrastructure error before polling again.
    #[serde(default = "default_infra_backoff_ms")]
    pub infra_backoff_ms: u64,
    /// Time reserved on a receipt for the store and queue calls around one
    /// external call.
    #[serde(default = "default_receipt_margin_ms")]
    pub receipt_margin_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,
}

/// External delivery API.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "dispatch".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_stream_name() -> String {
    "DISPATCH_OUTBOUND".to_string()
}
fn default_subject_prefix() -> String {
    "dispatch.outbound".to_string()
}
fn default_consumer_name() -> String {
    "dispatch-workers".to_string()
}
fn default_dead_letter_bucket() -> String {
    "dispatch-dead-letters".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}
fn default_bucket_capacity() -> f64 {
    3.0
}
fn default_refill_per_minute() -> f64 {
    10.0
}
fn default_limiter_idle_ttl_secs() -> u64 {
    3600
}
fn default_processing_margin_secs() -> u64 {
    5
}
fn default_done_ttl_secs() -> u64 {
    86_400
}
fn default_queue_backend() -> QueueBackend {
    QueueBackend::Memory
}
fn default_visibility_timeout_secs() -> u64 {
    30
}
fn default_max_receive_count() -> u32 {
    100
}
fn default_poll_wait_secs() -> u64 {
    20
}
fn default_poll_batch_size() -> usize {
    10
}
fn default_worker_count() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_backoff_jitter() -> bool {
    true
}
fn default_lease_retry_ms() -> u64 {
    250
}
fn default_infra_backoff_ms() -> u64 {
    1000
}
fn default_receipt_margin_ms() -> u64 {
    2000
}
fn default_max_batch_size() -> usize {
    100
}
fn default_max_payload_bytes() -> usize {
    256 * 1024
}
fn default_max_field_len() -> usize {
    256
}
fn default_delivery_endpoint() -> String {
    "http://localhost:9000/v1/deliver".to_string()
}
fn default_delivery_timeout_ms() -> u64 {
    10_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            consumer_name: default_consumer_name(),
            dead_letter_bucket: default_dead_letter_bucket(),
            max_reconnects: default_nats_max_reconnects(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            refill_per_minute: default_refill_per_minute(),
            idle_ttl_secs: default_limiter_idle_ttl_secs(),
        }
    }
}

impl LimiterConfig {
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_per_minute / 60.0
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            processing_margin_secs: default_processing_margin_secs(),
            done_ttl_secs: default_done_ttl_secs(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_queue_backend(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receive_count: default_max_receive_count(),
            poll_wait_secs: default_poll_wait_secs(),
            poll_batch_size: default_poll_batch_size(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter: default_backoff_jitter(),
            lease_retry_ms: default_lease_retry_ms(),
            infra_backoff_ms: default_infra_backoff_ms(),
            receipt_margin_ms: default_receipt_margin_ms(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_payload_bytes: default_max_payload_bytes(),
            max_field_len: default_max_field_len(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_delivery_endpoint(),
            timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            redis: RedisConfig::default(),
            nats: NatsConfig::default(),
            limiter: LimiterConfig::default(),
            idempotency: IdempotencyConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            admission: AdmissionConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DISPATCH_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls")
                .with_list_parse_key("nats.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// TTL of a processing claim: it must outlive the visibility timeout so a
    /// redelivered copy cannot start a second attempt while the first may
    /// still be running.
    pub fn processing_ttl(&self) -> Duration {
        self.queue.visibility_timeout() + Duration::from_secs(self.idempotency.processing_margin_secs)
    }

    /// TTL of a per-sender lease: covers one external call plus bookkeeping.
    pub fn lease_ttl(&self) -> Duration {
        self.delivery.timeout() + Duration::from_secs(self.idempotency.processing_margin_secs)
    }

    /// Receipt time one delivery needs: the external call plus bookkeeping.
    /// Items with less left on their receipt are released unprocessed.
    pub fn receipt_budget(&self) -> Duration {
        self.delivery.timeout() + Duration::from_millis(self.worker.receipt_margin_ms)
    }

    /// Reject settings that would break the delivery guarantees.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.limiter.capacity < 1.0 {
            return Err(DispatchError::Config("limiter.capacity must be at least 1".into()));
        }
        if self.limiter.refill_per_minute <= 0.0 {
            return Err(DispatchError::Config("limiter.refill_per_minute must be positive".into()));
        }
        if self.worker.max_attempts == 0 {
            return Err(DispatchError::Config("worker.max_attempts must be at least 1".into()));
        }
        if self.worker.count == 0 {
            return Err(DispatchError::Config("worker.count must be at least 1".into()));
        }
        if self.worker.backoff_factor < 1.0 {
            return Err(DispatchError::Config("worker.backoff_factor must be >= 1".into()));
        }
        if self.queue.visibility_timeout() <= self.receipt_budget() {
            return Err(DispatchError::Config(
                "queue.visibility_timeout_secs must exceed delivery.timeout_ms plus worker.receipt_margin_ms".into(),
            ));
        }
        if self.admission.max_batch_size == 0 {
            return Err(DispatchError::Config("admission.max_batch_size must be positive".into()));
        }
        tracing::debug!(node_id = %self.node_id, "Configuration validated");
        Ok(())
    }
}
