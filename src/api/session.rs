/// Storage of the caller's official-site session in an HttpOnly cookie
use super::SESSION_COOKIE;
use crate::{
    context::AppContext,
    error::{GatewayError, GatewayResult},
};
use axum::{
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

/// Header alternative to the JSON body
pub const SESSION_ID_HEADER: &str = "x-poe-sessid";

/// Seven days
pub const SESSION_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Shorter values cannot be a real session id
pub const MIN_SESSION_ID_LEN: usize = 20;

pub fn routes() -> Router<AppContext> {
    Router::new().route("/api/poe-session", post(store_session).delete(clear_session))
}

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    pub poesessid: Option<String>,
}

fn session_cookie(value: &str, max_age: u64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Secure; Max-Age={}",
        SESSION_COOKIE, value, max_age
    )
}

fn no_content_with_cookie(cookie: String) -> GatewayResult<Response> {
    let value = HeaderValue::from_str(&cookie)
        .map_err(|e| GatewayError::Internal(format!("Invalid cookie header: {}", e)))?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    response.headers_mut().insert(SET_COOKIE, value);
    Ok(response)
}

/// POST /api/poe-session
pub async fn store_session(
    headers: HeaderMap,
    body: Option<Json<SessionBody>>,
) -> GatewayResult<Response> {
    let from_body = body
        .and_then(|Json(body)| body.poesessid)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let from_header = || {
        headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let session_id = from_body.or_else(from_header).ok_or_else(|| {
        GatewayError::Validation(format!(
            "Missing poesessid in body or {} header",
            SESSION_ID_HEADER
        ))
    })?;

    if session_id.len() < MIN_SESSION_ID_LEN {
        return Err(GatewayError::Validation(
            "Provided POESESSID looks invalid (too short).".to_string(),
        ));
    }

    info!("Storing session cookie");
    no_content_with_cookie(session_cookie(
        &urlencoding::encode(&session_id),
        SESSION_MAX_AGE_SECS,
    ))
}

/// DELETE /api/poe-session
pub async fn clear_session() -> GatewayResult<Response> {
    no_content_with_cookie(session_cookie("", 0))
}
