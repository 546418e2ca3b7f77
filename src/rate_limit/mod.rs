/// Inbound rate limiting
///
/// Quotas are counted per `identity:endpoint` pair. A Redis sliding window is
/// the authority when configured, shared by every gateway instance. When it is
/// not configured, or fails at call time, checks fall back to an in-process
/// fixed window. The fallback only protects a single instance and is weaker:
/// N instances may together admit up to N times the quota.

pub mod distributed;
pub mod memory;

use crate::error::GatewayError;
use crate::metrics;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderValue, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use distributed::RedisStore;
pub use memory::MemoryStore;

/// Rate limit store errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        RateLimitError::Store(err.to_string())
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Redis URL; presence selects the durable store
    pub redis_url: Option<String>,
    /// Key prefix for Redis entries
    pub key_prefix: String,
    /// Window length
    pub window: Duration,
    /// Quota for endpoints without their own entry
    pub default_limit: u32,
    /// Per-endpoint quotas
    pub endpoint_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            key_prefix: "pobgw:".to_string(),
            window: Duration::from_secs(60),
            default_limit: 30,
            endpoint_limits: parse_endpoint_limits("characters=20,build=10,decode=60"),
        }
    }
}

impl RateLimitConfig {
    /// Quota for an endpoint, falling back to the default
    pub fn limit_for(&self, endpoint: &str) -> u32 {
        self.endpoint_limits
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Parse `name=limit` pairs separated by commas; malformed pairs are skipped
pub fn parse_endpoint_limits(raw: &str) -> HashMap<String, u32> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, limit) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            match limit.trim().parse::<u32>() {
                Ok(limit) => Some((name.to_string(), limit)),
                Err(_) => {
                    warn!("Ignoring malformed rate limit entry: {}", pair);
                    None
                }
            }
        })
        .collect()
}

/// State of one window after a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests in the window including the current one, admitted or not
    pub count: u64,
    /// When the window frees capacity again (unix seconds)
    pub reset_at: i64,
}

/// Backing store for window counters
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Backend name for logs and metrics
    fn backend(&self) -> &'static str;

    /// Count a request against `key`. Only admitted requests (count <= limit)
    /// consume capacity.
    async fn hit(&self, key: &str, limit: u32, window: Duration)
        -> Result<WindowCount, RateLimitError>;

    /// Drop elapsed windows, returning how many were removed
    async fn purge_expired(&self) -> usize {
        0
    }

    /// Release resources held by the store
    async fn close(&self) {}
}

/// Outcome of a rate limit check; identical for every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds
    pub reset_at: i64,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    /// Derive a decision from the window count
    pub fn from_count(limit: u32, window: WindowCount, now: i64) -> Self {
        let allowed = window.count <= limit as u64;
        let used = window.count.min(limit as u64) as u32;
        let retry_after_seconds = if allowed {
            None
        } else {
            Some((window.reset_at - now).max(1) as u64)
        };

        Self {
            allowed,
            limit,
            remaining: limit - used,
            reset_at: window.reset_at,
            retry_after_seconds,
        }
    }

    /// Write the X-RateLimit-* headers (and Retry-After when rejected)
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at));
        if let Some(retry_after) = self.retry_after_seconds {
            headers.insert("retry-after", HeaderValue::from(retry_after));
        }
    }
}

/// Rate limiter with a durable primary store and an in-process fallback
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    primary: Option<Arc<dyn RateLimitStore>>,
    fallback: Arc<MemoryStore>,
}

impl RateLimiter {
    /// Create a limiter with an explicit primary store
    pub fn new(config: RateLimitConfig, primary: Option<Arc<dyn RateLimitStore>>) -> Self {
        Self {
            config: Arc::new(config),
            primary,
            fallback: Arc::new(MemoryStore::new()),
        }
    }

    /// Create a limiter from configuration, connecting to Redis when a URL is set.
    ///
    /// A Redis connection failure at startup is not fatal: the limiter runs on
    /// the in-process store.
    pub async fn from_config(config: RateLimitConfig) -> Self {
        let primary: Option<Arc<dyn RateLimitStore>> = match &config.redis_url {
            Some(url) if config.enabled => {
                match RedisStore::connect(url, &config.key_prefix).await {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn RateLimitStore>),
                    Err(e) => {
                        warn!(
                            "Durable rate limit store unavailable, using in-process fallback: {}",
                            e
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            "Rate limiter ready (enabled: {}, backend: {})",
            config.enabled,
            primary.as_ref().map(|s| s.backend()).unwrap_or("memory")
        );

        Self::new(config, primary)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Name of the store checks go to first
    pub fn backend(&self) -> &'static str {
        self.primary
            .as_ref()
            .map(|s| s.backend())
            .unwrap_or_else(|| self.fallback.backend())
    }

    /// Check and count a request from `identity` to `endpoint`
    pub async fn check(&self, identity: &str, endpoint: &str) -> RateLimitDecision {
        let limit = self.config.limit_for(endpoint);
        let now = chrono::Utc::now().timestamp();

        if !self.config.enabled {
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: now + self.config.window.as_secs() as i64,
                retry_after_seconds: None,
            };
        }

        let key = format!("{}:{}", identity, endpoint);
        let window = self.config.window;

        let (count, backend) = match &self.primary {
            Some(primary) => match primary.hit(&key, limit, window).await {
                Ok(count) => (count, primary.backend()),
                Err(e) => {
                    warn!(
                        "Rate limit store '{}' failed, degrading to in-process window: {}",
                        primary.backend(),
                        e
                    );
                    (self.fallback.count(&key, limit, window), self.fallback.backend())
                }
            },
            None => (self.fallback.count(&key, limit, window), self.fallback.backend()),
        };

        let decision = RateLimitDecision::from_count(limit, count, now);
        metrics::record_rate_limit(endpoint, backend, decision.allowed);

        if decision.allowed {
            debug!(
                "Rate limit {} => {}/{} ({})",
                key, count.count, limit, backend
            );
        } else {
            warn!("Rate limit exceeded for {}: {}/{}", key, count.count, limit);
        }

        decision
    }

    /// Drop elapsed in-process windows
    pub async fn purge_expired(&self) -> usize {
        let mut removed = self.fallback.purge_expired().await;
        if let Some(primary) = &self.primary {
            removed += primary.purge_expired().await;
        }
        removed
    }

    /// Release both stores
    pub async fn close(&self) {
        if let Some(primary) = &self.primary {
            primary.close().await;
        }
        self.fallback.close().await;
    }
}

fn header_ip<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client identity: first `x-forwarded-for` entry, then `x-real-ip`, else
/// the peer address
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    header_ip(headers, "x-forwarded-for")
        .or_else(|| header_ip(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Logical endpoint name: the last non-empty path segment
pub fn endpoint_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("root")
}

/// Quota bucket for a request
///
/// `/api/resolve` runs one of the other cascades, so it is charged to the
/// bucket of the cascade it dispatches to: `build` when a character is
/// named, `characters` otherwise.
pub fn endpoint_for(uri: &Uri) -> String {
    let endpoint = endpoint_name(uri.path());
    if endpoint != "resolve" {
        return endpoint.to_string();
    }

    let names_character = Query::<HashMap<String, String>>::try_from_uri(uri)
        .ok()
        .and_then(|Query(params)| params.get("character").map(|c| !c.trim().is_empty()))
        .unwrap_or(false);

    let bucket = if names_character { "build" } else { "characters" };
    bucket.to_string()
}

/// Rate limiting middleware
///
/// Attaches the X-RateLimit-* headers to every response, admitted or not.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = client_identity(request.headers(), peer);
    let endpoint = endpoint_for(request.uri());

    let decision = limiter.check(&identity, &endpoint).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        GatewayError::RateLimitExceeded {
            retry_after: Duration::from_secs(decision.retry_after_seconds.unwrap_or(1)),
        }
        .into_response()
    };

    decision.apply_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RateLimitStore for FailingStore {
        fn backend(&self) -> &'static str {
            "failing"
        }

        async fn hit(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
        ) -> Result<WindowCount, RateLimitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RateLimitError::Store("connection refused".to_string()))
        }
    }

    fn config_with_limit(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            default_limit: limit,
            endpoint_limits: HashMap::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_decision_from_count() {
        let within = RateLimitDecision::from_count(
            3,
            WindowCount {
                count: 2,
                reset_at: 1_000,
            },
            990,
        );
        assert!(within.allowed);
        assert_eq!(within.remaining, 1);
        assert_eq!(within.retry_after_seconds, None);

        let over = RateLimitDecision::from_count(
            3,
            WindowCount {
                count: 4,
                reset_at: 1_000,
            },
            990,
        );
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
        assert_eq!(over.retry_after_seconds, Some(10));
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let over = RateLimitDecision::from_count(
            1,
            WindowCount {
                count: 2,
                reset_at: 1_000,
            },
            1_000,
        );
        assert_eq!(over.retry_after_seconds, Some(1));
    }

    #[tokio::test]
    async fn test_admits_exactly_limit() {
        let limiter = RateLimiter::new(config_with_limit(5), None);

        for i in 0..5 {
            let decision = limiter.check("10.0.0.1", "build").await;
            assert!(decision.allowed, "request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 4 - i);
        }

        let rejected = limiter.check("10.0.0.1", "build").await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_seconds.is_some());
    }

    #[tokio::test]
    async fn test_identities_and_endpoints_are_independent() {
        let limiter = RateLimiter::new(config_with_limit(1), None);

        assert!(limiter.check("a", "build").await.allowed);
        assert!(!limiter.check("a", "build").await.allowed);
        assert!(limiter.check("b", "build").await.allowed);
        assert!(limiter.check("a", "decode").await.allowed);
    }

    #[tokio::test]
    async fn test_degrades_to_memory_when_primary_fails() {
        let failing = Arc::new(FailingStore {
            calls: AtomicUsize::new(0),
        });
        let limiter = RateLimiter::new(
            config_with_limit(2),
            Some(failing.clone() as Arc<dyn RateLimitStore>),
        );

        assert!(limiter.check("a", "characters").await.allowed);
        assert!(limiter.check("a", "characters").await.allowed);
        let third = limiter.check("a", "characters").await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_always_admits() {
        let config = RateLimitConfig {
            enabled: false,
            default_limit: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, None);
        for _ in 0..10 {
            assert!(limiter.check("a", "anything").await.allowed);
        }
    }

    #[test]
    fn test_endpoint_limits() {
        let config = RateLimitConfig::default();
        assert_eq!(config.limit_for("characters"), 20);
        assert_eq!(config.limit_for("build"), 10);
        assert_eq!(config.limit_for("decode"), 60);
        assert_eq!(config.limit_for("poe-session"), 30);
    }

    #[test]
    fn test_parse_endpoint_limits_skips_malformed() {
        let limits = parse_endpoint_limits("a=1, b = 2 ,c=x,=4,d");
        assert_eq!(limits.len(), 2);
        assert_eq!(limits["a"], 1);
        assert_eq!(limits["b"], 2);
    }

    #[test]
    fn test_client_identity() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.7:5000".parse().unwrap();
        assert_eq!(client_identity(&headers, Some(peer)), "192.168.1.7");
        assert_eq!(client_identity(&headers, None), "unknown");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn test_client_identity_real_ip() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.7:5000".parse().unwrap();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_identity(&headers, Some(peer)), "198.51.100.4");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" "));
        assert_eq!(client_identity(&headers, Some(peer)), "198.51.100.4");
    }

    #[test]
    fn test_resolve_is_charged_to_its_cascade() {
        let endpoint = |uri: &str| endpoint_for(&uri.parse::<Uri>().unwrap());

        assert_eq!(endpoint("/api/resolve?handle=a&character=b"), "build");
        assert_eq!(endpoint("/api/resolve?handle=a&character=Witchy%20One"), "build");
        assert_eq!(endpoint("/api/resolve?handle=a"), "characters");
        assert_eq!(endpoint("/api/resolve?handle=a&character="), "characters");
        assert_eq!(endpoint("/api/resolve?handle=a&character=%20"), "characters");
        assert_eq!(endpoint("/api/resolve"), "characters");
        assert_eq!(endpoint("/api/build?character=b"), "build");
        assert_eq!(endpoint("/api/decode"), "decode");
    }

    #[test]
    fn test_endpoint_name() {
        assert_eq!(endpoint_name("/api/characters"), "characters");
        assert_eq!(endpoint_name("/api/build/"), "build");
        assert_eq!(endpoint_name("/api/poe-session"), "poe-session");
        assert_eq!(endpoint_name("/"), "root");
    }

    #[test]
    fn test_decision_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_000,
            retry_after_seconds: Some(42),
        };
        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);

        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1700000000");
        assert_eq!(headers["retry-after"], "42");
    }
}
