//! REST handlers for message admission, queue status and operational checks.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dispatch_admission::QueueAdmissionService;
use dispatch_core::{BatchItemResult, DispatchError, QueueStatus, SendReceipt, SendRequest};
use dispatch_store::AtomicStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use utoipa::ToSchema;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<QueueAdmissionService>,
    pub store: Arc<dyn AtomicStore>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BatchSendRequest {
    pub messages: Vec<SendRequest>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BatchSendResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub results: Vec<BatchItemResult>,
}

/// Maps engine errors onto HTTP responses.
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
        } else {
            warn!(error = %self.0, "Request rejected");
            metrics::counter!("api.validation_errors").increment(1);
        }
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal processing error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

/// POST /v1/messages — Admit one outbound message.
#[utoipa::path(
    post,
    path = "/v1/messages",
    tag = "Messages",
    request_body = SendRequest,
    responses(
        (status = 202, description = "Message queued for delivery", body = SendReceipt),
        (status = 400, description = "Invalid message", body = ErrorResponse),
        (status = 413, description = "Payload exceeds the size ceiling", body = ErrorResponse),
        (status = 503, description = "Queue unavailable", body = ErrorResponse),
    )
)]
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendReceipt>), ApiError> {
    let receipt = state.admission.send(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST /v1/messages/batch — Admit up to 100 messages, each independently.
#[utoipa::path(
    post,
    path = "/v1/messages/batch",
    tag = "Messages",
    request_body = BatchSendRequest,
    responses(
        (status = 202, description = "Per-item results", body = BatchSendResponse),
        (status = 400, description = "Batch empty or too large", body = ErrorResponse),
    )
)]
pub async fn send_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSendRequest>,
) -> Result<(StatusCode, Json<BatchSendResponse>), ApiError> {
    let results = state.admission.send_batch(&request.messages).await?;
    let accepted = results.iter().filter(|r| r.is_success()).count();
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchSendResponse {
            accepted,
            rejected: results.len() - accepted,
            results,
        }),
    ))
}

/// GET /v1/queue/status — Queue depth, in-flight and dead-letter counts, latency.
#[utoipa::path(
    get,
    path = "/v1/queue/status",
    tag = "Messages",
    responses(
        (status = 200, description = "Current queue status", body = QueueStatus),
        (status = 503, description = "Queue unavailable", body = ErrorResponse),
    )
)]
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.admission.get_queue_status().await?))
}

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is running", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready — Readiness check. 200 only when the shared store and the
/// queue both answer.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready to accept traffic"),
        (status = 503, description = "A backend is unavailable"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "Readiness: store unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Err(e) = state.admission.get_queue_status().await {
        warn!(error = %e, "Readiness: queue unavailable");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET /live — Liveness check.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
