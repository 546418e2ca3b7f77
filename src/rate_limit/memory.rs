/// In-process fixed-window rate limit store
///
/// Single-instance best effort: windows live in this process only and are
/// lost on restart.

use super::{RateLimitError, RateLimitStore, WindowCount};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    admitted: u64,
    started: Instant,
    length: Duration,
}

impl Window {
    fn is_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }
}

/// Fixed-window counters keyed by `identity:endpoint`
#[derive(Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request; the window restarts once its length has elapsed
    pub fn count(&self, key: &str, limit: u32, window: Duration) -> WindowCount {
        let now = Instant::now();
        let mut windows = self.windows.lock();

        let entry = windows.entry(key.to_string()).or_insert(Window {
            admitted: 0,
            started: now,
            length: window,
        });
        if entry.is_elapsed(now) {
            *entry = Window {
                admitted: 0,
                started: now,
                length: window,
            };
        }

        let count = entry.admitted + 1;
        if count <= limit as u64 {
            entry.admitted = count;
        }

        let remaining_window = window.saturating_sub(now.duration_since(entry.started));
        let reset_at =
            chrono::Utc::now().timestamp() + remaining_window.as_secs_f64().ceil() as i64;

        WindowCount { count, reset_at }
    }

    /// Number of tracked windows
    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowCount, RateLimitError> {
        Ok(self.count(key, limit, window))
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.is_elapsed(now));
        before - windows.len()
    }

    async fn close(&self) {
        self.windows.lock().clear();
    }
}
