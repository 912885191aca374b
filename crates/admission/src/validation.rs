//! Request validation at the admission boundary.

use chrono::{DateTime, Utc};
use dispatch_core::config::AdmissionConfig;
use dispatch_core::types::{DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
use dispatch_core::{DispatchError, DispatchResult, OutboundMessage, SendRequest};

fn required<'a>(field: &str, value: Option<&'a String>, max_len: usize) -> DispatchResult<&'a str> {
    match value {
        None => Err(DispatchError::Validation(format!("'{field}' is required"))),
        Some(v) => checked(field, v, max_len),
    }
}

fn checked<'a>(field: &str, value: &'a str, max_len: usize) -> DispatchResult<&'a str> {
    if value.trim().is_empty() {
        return Err(DispatchError::Validation(format!("'{field}' must not be empty")));
    }
    if value.chars().count() > max_len {
        return Err(DispatchError::Validation(format!(
            "'{field}' exceeds maximum length of {max_len}"
        )));
    }
    Ok(value)
}

/// Check a send request and build the message to enqueue.
pub fn build_message(
    request: &SendRequest,
    limits: &AdmissionConfig,
    now: DateTime<Utc>,
) -> DispatchResult<OutboundMessage> {
    let sender = required("sender_identity", request.sender_identity.as_ref(), limits.max_field_len)?;
    let recipient = required("recipient_id", request.recipient_id.as_ref(), limits.max_field_len)?;

    let message_id = match &request.message_id {
        Some(id) => checked("message_id", id, limits.max_field_len)?.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };

    let payload = match &request.payload {
        None | Some(serde_json::Value::Null) => {
            return Err(DispatchError::Validation("'payload' is required".into()))
        }
        Some(p) => p,
    };
    let size = serde_json::to_vec(payload)?.len();
    if size > limits.max_payload_bytes {
        return Err(DispatchError::PayloadTooLarge {
            size,
            limit: limits.max_payload_bytes,
        });
    }

    let priority = match request.priority {
        None => DEFAULT_PRIORITY,
        Some(p) if (MIN_PRIORITY as i64..=MAX_PRIORITY as i64).contains(&p) => p as u8,
        Some(p) => {
            return Err(DispatchError::Validation(format!(
                "'priority' {p} outside {MIN_PRIORITY}-{MAX_PRIORITY}"
            )))
        }
    };

    Ok(OutboundMessage::new(
        message_id,
        sender.to_string(),
        recipient.to_string(),
        payload.clone(),
        priority,
        now,
    ))
}
