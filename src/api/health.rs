/// Liveness and metrics endpoints
use crate::{context::AppContext, metrics};
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    /// Storage behind the inbound rate limiter: "redis" or "memory"
    pub rate_limit_backend: String,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
}

/// GET /health
pub async fn health_check(State(ctx): State<AppContext>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: ctx.config.service.version.clone(),
        rate_limit_backend: ctx.rate_limiter.backend().to_string(),
    })
}

/// GET /metrics, Prometheus text format
pub async fn metrics_endpoint() -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
        .into_response()
}
