//! Operator endpoints for the dead-letter queue.

use crate::rest::{ApiError, AppState, ErrorResponse};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use dispatch_core::{DeadLetterEntry, SendReceipt};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeadLetterList {
    pub count: usize,
    pub entries: Vec<DeadLetterEntry>,
}

/// GET /v1/dead-letters — Dead-lettered messages, oldest first.
#[utoipa::path(
    get,
    path = "/v1/dead-letters",
    tag = "Dead Letters",
    responses(
        (status = 200, description = "Dead-letter entries", body = DeadLetterList),
        (status = 503, description = "Queue unavailable", body = ErrorResponse),
    )
)]
pub async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<DeadLetterList>, ApiError> {
    let entries = state.admission.list_dead_lettered().await?;
    Ok(Json(DeadLetterList {
        count: entries.len(),
        entries,
    }))
}

/// POST /v1/dead-letters/{message_id}/replay — Re-enqueue with attempts reset.
#[utoipa::path(
    post,
    path = "/v1/dead-letters/{message_id}/replay",
    tag = "Dead Letters",
    params(("message_id" = String, Path, description = "Dead-lettered message id")),
    responses(
        (status = 202, description = "Message re-enqueued", body = SendReceipt),
        (status = 404, description = "No such dead letter", body = ErrorResponse),
    )
)]
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<(StatusCode, Json<SendReceipt>), ApiError> {
    let receipt = state.admission.replay(&message_id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// DELETE /v1/dead-letters/{message_id} — Drop a dead letter for good.
#[utoipa::path(
    delete,
    path = "/v1/dead-letters/{message_id}",
    tag = "Dead Letters",
    params(("message_id" = String, Path, description = "Dead-lettered message id")),
    responses(
        (status = 204, description = "Dead letter purged"),
        (status = 404, description = "No such dead letter", body = ErrorResponse),
    )
)]
pub async fn purge_dead_letter(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.admission.purge(&message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
