//! HTTP surface over the in-process backends.

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use chrono::Utc;
    use dispatch_admission::QueueAdmissionService;
    use dispatch_api::{router, AppState};
    use dispatch_core::config::AdmissionConfig;
    use dispatch_core::{DeadLetterEntry, FailureClass, ManualClock, OutboundMessage};
    use dispatch_queue::{DeliveryQueue, MemoryQueue};
    use dispatch_store::{AtomicStore, LocalStore};
    use dispatch_worker::DeliveryStats;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryQueue>) {
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(MemoryQueue::new(clock.clone(), Duration::from_secs(30), 100));
        let store: Arc<dyn AtomicStore> = Arc::new(LocalStore::new(clock.clone()));
        let limits = AdmissionConfig {
            max_payload_bytes: 1024,
            ..AdmissionConfig::default()
        };
        let admission = Arc::new(QueueAdmissionService::new(
            queue.clone(),
            Arc::new(DeliveryStats::default()),
            clock,
            limits,
        ));
        let state = AppState {
            admission,
            store,
            node_id: "node-test".to_string(),
            start_time: Instant::now(),
        };
        (router(state, 2 * 1024 * 1024), queue)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn message(id: &str) -> Value {
        json!({
            "message_id": id,
            "sender_identity": "brand-7",
            "recipient_id": "fan-1",
            "payload": {"text": "hello"}
        })
    }

    #[tokio::test]
    async fn test_send_returns_accepted() {
        let (app, queue) = app();
        let (status, body) = call(&app, "POST", "/v1/messages", Some(message("m1"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message_id"], "m1");
        assert!(body["queued_at"].is_string());
        assert_eq!(queue.stats().await.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn test_validation_and_size_errors() {
        let (app, _queue) = app();

        let mut bad = message("m1");
        bad["priority"] = json!(0);
        let (status, body) = call(&app, "POST", "/v1/messages", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        let mut big = message("m2");
        big["payload"] = json!({"text": "z".repeat(2000)});
        let (status, body) = call(&app, "POST", "/v1/messages", Some(big)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_batch_partial_success() {
        let (app, _queue) = app();
        let mut messages: Vec<Value> = (0..10).map(|i| message(&format!("m{i}"))).collect();
        messages.insert(3, json!({"sender_identity": "brand-7", "payload": {}}));

        let (status, body) = call(&app, "POST", "/v1/messages/batch", Some(json!({ "messages": messages }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 10);
        assert_eq!(body["rejected"], 1);
        assert_eq!(body["results"][3]["error"]["error"], "validation_error");
        assert_eq!(body["results"][4]["receipt"]["message_id"], "m3");
    }

    #[tokio::test]
    async fn test_oversize_batch_rejected() {
        let (app, _queue) = app();
        let messages: Vec<Value> = (0..101).map(|i| message(&format!("m{i}"))).collect();
        let (status, _) = call(&app, "POST", "/v1/messages/batch", Some(json!({ "messages": messages }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queue_status() {
        let (app, _queue) = app();
        call(&app, "POST", "/v1/messages", Some(message("m1"))).await;
        let (status, body) = call(&app, "GET", "/v1/queue/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["depth"], 1);
        assert_eq!(body["in_flight_count"], 0);
        assert_eq!(body["dead_letter_count"], 0);
        assert!(body["p50_latency_ms"].is_null());
    }

    #[tokio::test]
    async fn test_dead_letter_endpoints() {
        let (app, queue) = app();
        call(&app, "POST", "/v1/messages", Some(message("m1"))).await;
        let delivery = queue.poll(Duration::ZERO, 1).await.unwrap().remove(0);
        let mut msg: OutboundMessage = delivery.message;
        msg.attempt_count = 1;
        msg.record_failure(FailureClass::Permanent, "http_400", "rejected", Utc::now());
        queue
            .send_to_dead_letter(&delivery.token, DeadLetterEntry::new(msg, "permanent failure", Utc::now()))
            .await
            .unwrap();

        let (status, body) = call(&app, "GET", "/v1/dead-letters", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["message"]["message_id"], "m1");
        assert_eq!(body["entries"][0]["failure_history"][0]["class"], "permanent");

        let (status, body) = call(&app, "POST", "/v1/dead-letters/m1/replay", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message_id"], "m1");

        let (status, _) = call(&app, "DELETE", "/v1/dead-letters/m1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(queue.stats().await.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn test_health_checks_and_openapi() {
        let (app, _queue) = app();
        assert_eq!(call(&app, "GET", "/live", None).await.0, StatusCode::OK);
        assert_eq!(call(&app, "GET", "/ready", None).await.0, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "node-test");

        let (status, body) = call(&app, "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/v1/messages"].is_object());
        assert!(body["paths"]["/v1/dead-letters/{message_id}/replay"].is_object());
    }
}
