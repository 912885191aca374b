use std::time::Duration;
use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Not a failure: the sender's bucket is empty and the work should be
    /// retried after the given delay.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Transient delivery error ({code}): {detail}")]
    TransientDelivery { code: String, detail: String },

    #[error("Permanent delivery error ({code}): {detail}")]
    PermanentDelivery { code: String, detail: String },

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn infrastructure(err: impl std::fmt::Display) -> Self {
        DispatchError::Infrastructure(err.to_string())
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Config(_) => "config_error",
            DispatchError::Validation(_) => "validation_error",
            DispatchError::PayloadTooLarge { .. } => "payload_too_large",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::TransientDelivery { .. } => "transient_delivery_error",
            DispatchError::PermanentDelivery { .. } => "permanent_delivery_error",
            DispatchError::Infrastructure(_) => "infrastructure_error",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Serialization(_) => "serialization_error",
            DispatchError::Internal(_) => "internal_error",
        }
    }

    /// Whether a post-admission failure should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::RateLimited { .. }
                | DispatchError::TransientDelivery { .. }
                | DispatchError::Infrastructure(_)
        )
    }
}
