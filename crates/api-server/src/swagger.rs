//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Dispatch Engine API",
        version = "0.1.0",
        description = "Rate-limited outbound message dispatch.\n\nProducers enqueue messages; workers deliver them to the external messaging API under a per-sender token bucket, with retries and a dead-letter queue.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Messages", description = "Message admission and queue status"),
        (name = "Dead Letters", description = "Inspect, replay and purge dead-lettered messages"),
        (name = "Operations", description = "Health, readiness, and liveness checks"),
    ),
    paths(
        // Messages
        crate::rest::send_message,
        crate::rest::send_batch,
        crate::rest::queue_status,
        // Dead letters
        crate::dead_letter_rest::list_dead_letters,
        crate::dead_letter_rest::replay_dead_letter,
        crate::dead_letter_rest::purge_dead_letter,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        dispatch_core::SendRequest,
        dispatch_core::SendReceipt,
        dispatch_core::BatchItemResult,
        dispatch_core::BatchItemError,
        dispatch_core::QueueStatus,
        dispatch_core::OutboundMessage,
        dispatch_core::MessageStatus,
        dispatch_core::FailureRecord,
        dispatch_core::FailureClass,
        dispatch_core::DeadLetterEntry,
        crate::rest::BatchSendRequest,
        crate::rest::BatchSendResponse,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
        crate::dead_letter_rest::DeadLetterList,
    ))
)]
pub struct ApiDoc;
