/// Resilient upstream HTTP client
///
/// Every attempt is bounded by its own timeout. Server errors, network errors
/// and timeouts are retried with exponential backoff; 403 and 429 are
/// surfaced immediately as typed errors since retrying cannot change an
/// access decision and only digs deeper into a rate limit.
use crate::metrics;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Default number of attempts per fetch
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(12_000);

/// Default backoff base delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(300);

/// Retry-After assumed when a 429 carries none
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Upstream fetch errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream rate limited the request, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("upstream refused access (HTTP 403)")]
    Forbidden,

    #[error("upstream returned HTTP {status}")]
    Server { status: u16 },

    #[error("invalid upstream URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Network(_) | FetchError::Server { .. }
        )
    }

    fn label(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Network(_) => "network",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Forbidden => "forbidden",
            FetchError::Server { .. } => "server_error",
            FetchError::InvalidUrl(_) => "invalid_url",
        }
    }

    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else if err.is_connect() {
            FetchError::Network("failed to connect to upstream".to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Bound on a single attempt (request and body)
    pub timeout_per_attempt: Duration,
    /// Delay after the first failed attempt; doubles after each subsequent one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_per_attempt: DEFAULT_TIMEOUT,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Drive `attempt` until it succeeds, fails terminally or attempts run out
    ///
    /// Sleeps `backoff_delay(n)` after failed attempt `n` when another follows.
    /// The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, target: &str, mut attempt: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut n = 1;

        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || n >= max_attempts => {
                    debug!("{} failed (attempt {}): {}, not retrying", target, n, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff_delay(n);
                    warn!(
                        "{} failed (attempt {}): {}, retrying in {:?}",
                        target, n, e, delay
                    );
                    sleep(delay).await;
                    n += 1;
                }
            }
        }
    }
}

/// A fully read upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the upstream declared a JSON body
    pub fn is_json(&self) -> bool {
        self.content_type
            .to_ascii_lowercase()
            .contains("application/json")
    }

    /// Parse the body as JSON regardless of the declared content type
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.body.trim())
    }

    /// Short body excerpt for diagnostics
    pub fn excerpt(&self) -> String {
        excerpt(&self.body)
    }
}

/// Truncate untrusted text for internal diagnostics
pub fn excerpt(text: &str) -> String {
    const LIMIT: usize = 160;
    let trimmed = text.trim();
    if trimmed.chars().count() <= LIMIT {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(LIMIT).collect();
        format!("{}... ({} bytes)", head, trimmed.len())
    }
}

/// HTTP client for upstream sources with timeout, retry and backoff
#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    default_headers: HeaderMap,
    throttle: Option<Arc<DefaultDirectRateLimiter>>,
}

impl FetchClient {
    /// Create a new fetch client
    pub fn new(user_agent: &str, policy: RetryPolicy) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to create HTTP client: {}", e)))?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/html, */*; q=0.9"),
        );
        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        default_headers.insert(
            reqwest::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
        default_headers.insert(reqwest::header::PRAGMA, HeaderValue::from_static("no-cache"));

        Ok(Self {
            http,
            policy,
            default_headers,
            throttle: None,
        })
    }

    /// Throttle outbound requests to at most `per_second` across all callers
    pub fn with_throttle(mut self, per_second: u32) -> Self {
        self.throttle = NonZeroU32::new(per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        self
    }

    /// The default retry policy of this client
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetch a URL using the client's retry policy
    pub async fn fetch(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<UpstreamResponse, FetchError> {
        self.fetch_with_policy(url, headers, &self.policy).await
    }

    /// Fetch a URL with an explicit retry policy
    pub async fn fetch_with_policy(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        policy: &RetryPolicy,
    ) -> Result<UpstreamResponse, FetchError> {
        policy
            .run(url, |attempt| async move {
                if let Some(throttle) = &self.throttle {
                    throttle.until_ready().await;
                }

                debug!(
                    "Upstream GET {} (attempt {}/{})",
                    url,
                    attempt,
                    policy.max_attempts.max(1)
                );

                let result = self.attempt(url, headers, policy.timeout_per_attempt).await;
                let label = match &result {
                    Ok(response) => {
                        trace!("Upstream {} answered {}", url, response.status);
                        "ok"
                    }
                    Err(e) => e.label(),
                };
                metrics::UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[label])
                    .inc();
                result
            })
            .await
    }

    /// One bounded request/response exchange
    async fn attempt(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<UpstreamResponse, FetchError> {
        let mut request_headers = self.default_headers.clone();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::InvalidUrl(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::InvalidUrl(format!("invalid header value: {}", e)))?;
            request_headers.insert(name, value);
        }

        let request = self.http.get(url).headers(request_headers);

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, content_type, retry_after, body))
        };

        let (status, content_type, retry_after, body) =
            match tokio::time::timeout(timeout, exchange).await {
                Err(_) => return Err(FetchError::Timeout(timeout)),
                Ok(Err(e)) => return Err(FetchError::from_reqwest(e, timeout)),
                Ok(Ok(parts)) => parts,
            };

        match status {
            StatusCode::FORBIDDEN => Err(FetchError::Forbidden),
            StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
                retry_after: Duration::from_secs(
                    retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
                ),
            }),
            status if status.is_server_error() => Err(FetchError::Server {
                status: status.as_u16(),
            }),
            status => Ok(UpstreamResponse {
                status,
                content_type,
                body,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 5,
            timeout_per_attempt: Duration::from_secs(1),
            base_delay: Duration::from_millis(300),
        };

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(300));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(600));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(1200));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(2400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_between_retryable_failures() {
        let policy = RetryPolicy {
            max_attempts: 3,
            timeout_per_attempt: Duration::from_secs(1),
            base_delay: Duration::from_millis(300),
        };
        let started = tokio::time::Instant::now();
        let mut seen = Vec::new();

        let result: Result<(), FetchError> = policy
            .run("test", |attempt| {
                seen.push((attempt, started.elapsed().as_millis()));
                async { Err(FetchError::Server { status: 503 }) }
            })
            .await;

        assert_eq!(result, Err(FetchError::Server { status: 503 }));
        assert_eq!(
            seen,
            vec![(1, 0), (2, 300), (3, 900)]
        );
        // No sleep after the final attempt
        assert_eq!(started.elapsed().as_millis(), 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_terminal_error_and_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            timeout_per_attempt: Duration::from_secs(1),
            base_delay: Duration::from_millis(100),
        };
        let started = tokio::time::Instant::now();

        let mut calls = 0;
        let result: Result<(), FetchError> = policy
            .run("test", |_| {
                calls += 1;
                async { Err(FetchError::Forbidden) }
            })
            .await;
        assert_eq!(result, Err(FetchError::Forbidden));
        assert_eq!(calls, 1);
        assert_eq!(started.elapsed().as_millis(), 0);

        let result = policy
            .run("test", |attempt| async move {
                if attempt < 2 {
                    Err(FetchError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(started.elapsed().as_millis(), 100);
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            timeout_per_attempt: Duration::from_secs(1),
            base_delay: Duration::from_secs(u64::MAX / 2),
        };
        assert_eq!(policy.backoff_delay(40), Duration::MAX);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(FetchError::Network("reset".to_string()).is_retryable());
        assert!(FetchError::Server { status: 503 }.is_retryable());
        assert!(!FetchError::Forbidden.is_retryable());
        assert!(!FetchError::RateLimited {
            retry_after: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(!FetchError::InvalidUrl("nope".to_string()).is_retryable());
    }

    #[test]
    fn test_response_json_detection() {
        let response = UpstreamResponse {
            status: StatusCode::OK,
            content_type: "Application/JSON; charset=utf-8".to_string(),
            body: " [1, 2, 3] ".to_string(),
        };
        assert!(response.is_json());
        assert_eq!(response.json::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_excerpt_truncates_long_bodies() {
        let long = "x".repeat(1000);
        let short = excerpt(&long);
        assert!(short.len() < 200);
        assert!(short.ends_with("(1000 bytes)"));
        assert_eq!(excerpt("  short  "), "short");
    }

    #[test]
    fn test_client_creation() {
        let client = FetchClient::new("pob-gateway-test", RetryPolicy::default());
        assert!(client.is_ok());
    }
}
