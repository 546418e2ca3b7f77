use crate::context::AppContext;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

/// Expired result cache entries are swept this often
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Elapsed rate limit windows are swept this often
pub const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(120);

/// Job scheduler for background maintenance
///
/// Expired entries are already evicted lazily on access; these sweeps only
/// bound memory for keys that are never read again.
pub struct JobScheduler {
    context: Arc<AppContext>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self {
            context,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start all background jobs
    pub fn start(self: &Arc<Self>) {
        info!("Starting background job scheduler");

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(Self::cache_purge_job(Arc::clone(self))));
        handles.push(tokio::spawn(Self::rate_limit_purge_job(Arc::clone(self))));

        info!("Background jobs started");
    }

    /// Number of jobs currently running
    pub fn running(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Abort all background jobs
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        info!("Stopped {} background jobs", handles.len());
    }

    async fn cache_purge_job(scheduler: Arc<Self>) {
        let mut interval = interval(CACHE_PURGE_INTERVAL);

        loop {
            interval.tick().await;

            let removed = scheduler.context.resolver.purge_expired();
            if removed > 0 {
                info!("Purged {} expired cache entries", removed);
            } else {
                debug!("Cache purge: nothing expired");
            }
        }
    }

    async fn rate_limit_purge_job(scheduler: Arc<Self>) {
        let mut interval = interval(RATE_LIMIT_PURGE_INTERVAL);

        loop {
            interval.tick().await;

            let removed = scheduler.context.rate_limiter.purge_expired().await;
            if removed > 0 {
                info!("Purged {} elapsed rate limit windows", removed);
            }
        }
    }
}
