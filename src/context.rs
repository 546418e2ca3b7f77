/// Application context and dependency injection
use crate::{
    config::ServerConfig,
    error::{GatewayError, GatewayResult},
    rate_limit::RateLimiter,
    resolver::{BuildReconstructor, HttpReconstructor, Resolver, UnavailableReconstructor},
    upstream::FetchClient,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub resolver: Arc<Resolver>,
    pub rate_limiter: RateLimiter,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> GatewayResult<Self> {
        // Validate configuration
        config.validate()?;

        let fetch = FetchClient::new(&config.upstream.user_agent, config.upstream.retry)
            .map_err(|e| GatewayError::Internal(format!("Failed to create fetch client: {}", e)))?
            .with_throttle(config.upstream.requests_per_second);

        let reconstructor: Arc<dyn BuildReconstructor> = match &config.reconstruct.url {
            Some(url) => {
                info!("Build reconstruction enabled");
                Arc::new(
                    HttpReconstructor::new(
                        url,
                        config.reconstruct.api_key.clone(),
                        config.reconstruct.timeout,
                    )
                    .map_err(|e| GatewayError::Internal(e.to_string()))?,
                )
            }
            None => {
                warn!("RECONSTRUCT_URL not set - reconstruction fallback disabled");
                Arc::new(UnavailableReconstructor)
            }
        };

        let resolver = Arc::new(Resolver::new(
            config.resolver(),
            fetch,
            reconstructor,
            config.cache.clone(),
        ));

        let rate_limiter = RateLimiter::from_config(config.rate_limit.clone()).await;

        Ok(Self::from_parts(config, resolver, rate_limiter))
    }

    /// Assemble a context from already constructed services
    pub fn from_parts(
        config: ServerConfig,
        resolver: Arc<Resolver>,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            rate_limiter,
        }
    }

    /// Release shared state held by the services
    pub async fn close(&self) {
        info!("Closing result cache and rate limiter");
        self.resolver.close();
        self.rate_limiter.close().await;
    }
}
