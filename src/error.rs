/// Unified error types for the gateway
use crate::codec::CodecError;
use crate::upstream::FetchError;
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// One failed strategy in a cascade run
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub error: ResolveError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

/// Resolution errors, ordered by how actionable they are for the user
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream rate limited the request, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Profile or character is private
    #[error("access forbidden: {0}")]
    Forbidden(String),

    /// Account or character unknown
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected content type or body shape
    #[error("unexpected upstream response: {0}")]
    UpstreamProtocol(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Import succeeded structurally but carried no build data
    #[error("character has no equipped items or skills")]
    EmptyBuild,

    /// A strategy's collaborator is not configured
    #[error("{0} is unavailable")]
    Unavailable(String),

    /// Every strategy failed; `cause` is the most specific failure seen
    #[error("all strategies exhausted ({})", format_attempts(.attempts))]
    AllStrategiesExhausted {
        cause: Box<ResolveError>,
        attempts: Vec<StrategyFailure>,
    },
}

fn format_attempts(attempts: &[StrategyFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ResolveError {
    /// Rank used to keep the most actionable error across strategy transitions
    pub fn specificity(&self) -> u8 {
        match self {
            ResolveError::Forbidden(_) | ResolveError::NotFound(_) => 4,
            ResolveError::RateLimited { .. } => 3,
            ResolveError::Codec(_) | ResolveError::EmptyBuild => 2,
            ResolveError::UpstreamProtocol(_) | ResolveError::Unavailable(_) => 1,
            ResolveError::Timeout(_) | ResolveError::Network(_) => 0,
            ResolveError::AllStrategiesExhausted { cause, .. } => cause.specificity(),
        }
    }

    /// Whether the error carries its own remediation for the user
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            ResolveError::Forbidden(_)
                | ResolveError::NotFound(_)
                | ResolveError::RateLimited { .. }
        )
    }

    /// Stable label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Timeout(_) => "timeout",
            ResolveError::Network(_) => "network",
            ResolveError::RateLimited { .. } => "rate_limited",
            ResolveError::Forbidden(_) => "forbidden",
            ResolveError::NotFound(_) => "not_found",
            ResolveError::UpstreamProtocol(_) => "protocol",
            ResolveError::Codec(_) => "codec",
            ResolveError::EmptyBuild => "empty_build",
            ResolveError::Unavailable(_) => "unavailable",
            ResolveError::AllStrategiesExhausted { .. } => "exhausted",
        }
    }
}

impl From<FetchError> for ResolveError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout(after) => {
                ResolveError::Timeout(format!("no response after {:?}", after))
            }
            FetchError::Network(msg) => ResolveError::Network(msg),
            FetchError::RateLimited { retry_after } => ResolveError::RateLimited { retry_after },
            FetchError::Forbidden => {
                ResolveError::Forbidden("upstream returned HTTP 403".to_string())
            }
            FetchError::Server { status } => {
                ResolveError::UpstreamProtocol(format!("upstream returned HTTP {}", status))
            }
            FetchError::InvalidUrl(msg) => ResolveError::UpstreamProtocol(msg),
        }
    }
}

/// Top-level error type for request handling
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The gateway's own inbound limiter rejected the request
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CodecError> for GatewayError {
    fn from(err: CodecError) -> Self {
        GatewayError::Resolve(ResolveError::Codec(err))
    }
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn retry_message(retry_after: Duration) -> String {
    format!("Try again in {} seconds.", retry_after.as_secs().max(1))
}

/// Status, error code, user-facing message and optional Retry-After
fn describe(err: &ResolveError) -> (StatusCode, &'static str, String, Option<Duration>) {
    match err {
        ResolveError::Forbidden(_) => (
            StatusCode::FORBIDDEN,
            "Forbidden",
            "This profile is private. Set your character tab to public on pathofexile.com and try again.".to_string(),
            None,
        ),
        ResolveError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            "NotFound",
            "Account or character not found. Check the spelling of the account name (including the #1234 suffix) and the character name.".to_string(),
            None,
        ),
        ResolveError::RateLimited { retry_after } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "UpstreamRateLimited",
            format!(
                "Path of Exile is rate limiting requests. {}",
                retry_message(*retry_after)
            ),
            Some(*retry_after),
        ),
        ResolveError::Timeout(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            "UpstreamTimeout",
            "The upstream service took too long to respond. Try again later.".to_string(),
            None,
        ),
        ResolveError::Codec(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "InvalidShareCode",
            "The build code could not be decoded. Make sure the whole code was copied.".to_string(),
            None,
        ),
        ResolveError::EmptyBuild => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "EmptyBuild",
            "The character has no equipped items or skills to import.".to_string(),
            None,
        ),
        ResolveError::Unavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "ServiceUnavailable",
            "This lookup is not available right now. Try again later.".to_string(),
            None,
        ),
        ResolveError::UpstreamProtocol(_) | ResolveError::Network(_) => (
            StatusCode::BAD_GATEWAY,
            "UpstreamUnavailable",
            "The upstream service returned an unexpected response. Try again later.".to_string(),
            None,
        ),
        ResolveError::AllStrategiesExhausted { .. } => (
            StatusCode::BAD_GATEWAY,
            "AllStrategiesExhausted",
            "The build could not be retrieved from any source. Try again later, or paste a build code instead.".to_string(),
            None,
        ),
    }
}

/// Convert GatewayError to HTTP response
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_code, message, retry_after) = match &self {
            GatewayError::Resolve(err) => describe(err),
            GatewayError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest", msg.clone(), None)
            }
            GatewayError::RateLimitExceeded { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                format!("Too many requests. {}", retry_message(*retry_after)),
                Some(*retry_after),
            ),
            GatewayError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        let mut response = (status, body).into_response();
        if let Some(retry_after) = retry_after {
            response.headers_mut().insert(
                RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs().max(1)),
            );
        }
        response
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
