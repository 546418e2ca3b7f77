/// HTTP server setup and routing
use crate::{
    api::{self, health},
    context::AppContext,
    error::{GatewayError, GatewayResult},
    metrics,
    rate_limit::rate_limit_middleware,
};
use axum::{
    extract::{MatchedPath, Request},
    http::{header, HeaderName, Method, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(api::SESSION_HEADER),
            HeaderName::from_static(api::session::SESSION_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            header::RETRY_AFTER,
        ]);

    // Only the API is rate limited; health and metrics stay reachable
    let api_routes = api::routes().layer(middleware::from_fn_with_state(
        ctx.rate_limiter.clone(),
        rate_limit_middleware,
    ));

    Router::new()
        .merge(health::routes())
        .merge(api_routes)
        .with_state(ctx)
        .fallback(not_found)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Count requests and their latency per matched route
async fn track_http_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Start the HTTP server and run until Ctrl-C
pub async fn serve(ctx: AppContext) -> GatewayResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("PoB gateway listening on {}", addr);
    info!("   Official site: {}", ctx.config.upstream.poe_base_url);
    info!("   Import service: {}", ctx.config.upstream.import_base_url);
    info!("   Rate limit backend: {}", ctx.rate_limiter.backend());

    let app = build_router(ctx.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    // Peer addresses feed the rate limiter's client identity
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    ctx.close().await;
    Ok(())
}
