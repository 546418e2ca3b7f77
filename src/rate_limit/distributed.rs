/// Distributed rate limiting using Redis
///
/// A true sliding window over a sorted set per `identity:endpoint` key:
/// entries older than the window are trimmed (ZREMRANGEBYSCORE), the rest
/// counted (ZCARD) and the request recorded (ZADD) only when admitted. The
/// steps run as one Lua script so concurrent instances never over-admit.

use super::{RateLimitError, RateLimitStore, WindowCount};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{debug, error, info};

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
if count < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window)
end

local reset = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset = tonumber(oldest[2]) + window
end

return {count + 1, reset}
"#;

/// Sliding-window store shared by every gateway instance
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, RateLimitError> {
        info!("Connecting to Redis rate limit store");

        let client = Client::open(redis_url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            RateLimitError::Store(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            RateLimitError::Store(format!("Redis connection failed: {}", e))
        })?;

        info!("Redis rate limit store connected");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    /// Build a key with prefix
    fn build_key(&self, key: &str) -> String {
        format!("{}ratelimit:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowCount, RateLimitError> {
        let full_key = self.build_key(key);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());

        let mut conn = self.connection.clone();
        let (count, reset_ms): (u64, i64) = self
            .script
            .key(&full_key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        debug!("Sliding window {} => {}/{}", full_key, count, limit);

        Ok(WindowCount {
            count,
            reset_at: (reset_ms + 999) / 1000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::MemoryStore;

    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        let prefix = format!("pobgw-test-{}:", uuid::Uuid::new_v4());
        RedisStore::connect(&url, &prefix).await.ok()
    }

    #[tokio::test]
    async fn test_sliding_window_admits_exactly_limit() {
        let Some(store) = test_store().await else {
            return;
        };
        let window = Duration::from_secs(60);

        for expected in 1..=3u64 {
            let result = store.hit("1.2.3.4:build", 3, window).await.unwrap();
            assert_eq!(result.count, expected);
        }
        let rejected = store.hit("1.2.3.4:build", 3, window).await.unwrap();
        assert_eq!(rejected.count, 4);

        let again = store.hit("1.2.3.4:build", 3, window).await.unwrap();
        assert_eq!(again.count, 4);
    }

    #[tokio::test]
    async fn test_matches_memory_store_decisions() {
        let Some(redis) = test_store().await else {
            return;
        };
        let memory = MemoryStore::new();
        let window = Duration::from_secs(60);

        for _ in 0..8 {
            let a = redis.hit("5.6.7.8:decode", 5, window).await.unwrap();
            let b = memory.hit("5.6.7.8:decode", 5, window).await.unwrap();
            assert_eq!(a.count <= 5, b.count <= 5);
            assert_eq!(a.count, b.count);
        }
    }
}
