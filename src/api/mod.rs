/// API routes and handlers
pub mod decode;
pub mod health;
pub mod resolve;
pub mod session;

use crate::context::AppContext;
use axum::http::HeaderMap;
use axum::Router;
use axum_extra::{headers::Cookie, TypedHeader};

/// Header carrying a raw upstream cookie string
pub const SESSION_HEADER: &str = "x-poe-cookie";

/// Name of the official site's session cookie
pub const SESSION_COOKIE: &str = "POESESSID";

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(resolve::routes())
        .merge(decode::routes())
        .merge(session::routes())
}

/// Session to forward to the official site, if the caller supplied one
///
/// The explicit header wins over the stored cookie.
pub fn forwarded_session(
    headers: &HeaderMap,
    cookies: Option<&TypedHeader<Cookie>>,
) -> Option<String> {
    let explicit = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(raw) = explicit {
        return Some(raw.to_string());
    }

    cookies
        .and_then(|TypedHeader(cookie)| cookie.get(SESSION_COOKIE))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("{}={}", SESSION_COOKIE, v))
}
