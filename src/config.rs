/// Configuration management for the gateway
use crate::cache::CacheConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limit::{parse_endpoint_limits, RateLimitConfig};
use crate::resolver::ResolverConfig;
use crate::upstream::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Main server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub upstream: UpstreamConfig,
    pub reconstruct: ReconstructConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// End-to-end deadline of one resolution
    pub request_deadline: Duration,
}

/// Upstream sources and outbound client behaviour
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub poe_base_url: String,
    pub default_realm: String,
    pub import_base_url: String,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Outbound politeness throttle
    pub requests_per_second: u32,
}

/// Reconstruction collaborator
#[derive(Debug, Clone)]
pub struct ReconstructConfig {
    /// Unset disables the reconstruction strategy
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Collaborator timeout, also the minimum budget needed to start it
    pub timeout: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> GatewayResult<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GatewayError::Validation(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: u64) -> GatewayResult<Duration> {
    env_parse(name, default).map(Duration::from_millis)
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> GatewayResult<Self> {
        dotenv::dotenv().ok();

        let service = ServiceConfig {
            hostname: env_or("GATEWAY_HOSTNAME", "0.0.0.0"),
            port: env_parse("GATEWAY_PORT", 8787)?,
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_deadline: env_millis("GATEWAY_REQUEST_DEADLINE_MS", 25_000)?,
        };

        let upstream = UpstreamConfig {
            poe_base_url: env_or("POE_BASE_URL", "https://www.pathofexile.com"),
            default_realm: env_or("POE_DEFAULT_REALM", "pc"),
            import_base_url: env_or("IMPORT_BASE_URL", "https://pobbin.com"),
            user_agent: env_or("UPSTREAM_USER_AGENT", DEFAULT_USER_AGENT),
            retry: RetryPolicy {
                max_attempts: env_parse("UPSTREAM_MAX_ATTEMPTS", 3)?,
                timeout_per_attempt: env_millis("UPSTREAM_TIMEOUT_MS", 12_000)?,
                base_delay: env_millis("UPSTREAM_BACKOFF_BASE_MS", 300)?,
            },
            requests_per_second: env_parse("UPSTREAM_REQUESTS_PER_SECOND", 4)?,
        };

        let reconstruct = ReconstructConfig {
            url: env_opt("RECONSTRUCT_URL"),
            api_key: env_opt("RECONSTRUCT_API_KEY"),
            timeout: env_millis("RECONSTRUCT_TIMEOUT_MS", 20_000)?,
        };

        let cache = CacheConfig {
            ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", 60)?),
        };

        let rate_limit = RateLimitConfig {
            enabled: env_parse("RATE_LIMIT_ENABLED", true)?,
            redis_url: env_opt("RATE_LIMIT_REDIS_URL"),
            key_prefix: env_or("RATE_LIMIT_KEY_PREFIX", "pobgw:"),
            window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 60)?),
            default_limit: env_parse("RATE_LIMIT_DEFAULT", 30)?,
            endpoint_limits: parse_endpoint_limits(&env_or(
                "RATE_LIMIT_ENDPOINTS",
                "characters=20,build=10,decode=60",
            )),
        };

        Ok(ServerConfig {
            service,
            upstream,
            reconstruct,
            cache,
            rate_limit,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> GatewayResult<()> {
        if self.service.hostname.is_empty() {
            return Err(GatewayError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.upstream.retry.max_attempts == 0 {
            return Err(GatewayError::Validation(
                "UPSTREAM_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(GatewayError::Validation(
                "RATE_LIMIT_WINDOW_SECS must be at least 1".to_string(),
            ));
        }

        let mut urls = vec![
            ("POE_BASE_URL", self.upstream.poe_base_url.as_str()),
            ("IMPORT_BASE_URL", self.upstream.import_base_url.as_str()),
        ];
        if let Some(url) = &self.reconstruct.url {
            urls.push(("RECONSTRUCT_URL", url.as_str()));
        }
        for (name, url) in urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(GatewayError::Validation(format!(
                    "{} must be an http(s) URL",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Resolver settings derived from this configuration
    pub fn resolver(&self) -> ResolverConfig {
        ResolverConfig {
            poe_base_url: self.upstream.poe_base_url.clone(),
            import_base_url: self.upstream.import_base_url.clone(),
            default_realm: self.upstream.default_realm.clone(),
            request_deadline: self.service.request_deadline,
            reconstruct_min_budget: self.reconstruct.timeout,
        }
    }
}
