//! API server: the REST router, the HTTP listener and the metrics exporter.

use crate::dead_letter_rest;
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use dispatch_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Slack on top of the payload ceiling for message metadata and JSON framing.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the full router. `body_limit` caps request bodies in bytes.
pub fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        // Producer API
        .route("/v1/messages", post(rest::send_message))
        .route("/v1/messages/batch", post(rest::send_batch))
        .route("/v1/queue/status", get(rest::queue_status))
        // Operator API
        .route("/v1/dead-letters", get(dead_letter_rest::list_dead_letters))
        .route(
            "/v1/dead-letters/:message_id/replay",
            post(dead_letter_rest::replay_dead_letter),
        )
        .route(
            "/v1/dead-letters/:message_id",
            delete(dead_letter_rest::purge_dead_letter),
        )
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Largest request body accepted: a full batch of maximum-size payloads.
    pub fn body_limit(&self) -> usize {
        let admission = &self.config.admission;
        admission
            .max_payload_bytes
            .saturating_add(BODY_OVERHEAD_BYTES)
            .saturating_mul(admission.max_batch_size.max(1))
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let app = router(self.state.clone(), self.body_limit());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
