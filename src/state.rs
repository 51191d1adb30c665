//! Shared application state for Axum handlers and admission middleware.
//!
//! - **Configuration**: Runtime configuration access
//! - **Trust Resolver**: Swappable trusted-proxy snapshot shared by every rate limit stage
//! - **Rate Limit Store**: One store behind all stages (keys are surface-specific)
//! - **Node Registry**: Consulted by cluster authentication and readiness
//!
//! # Structured Concurrency
//!
//! Background tasks (idle bucket eviction, SIGHUP trust reload) are managed
//! using `tokio_util::task::TaskTracker` and `CancellationToken`. Call
//! `shutdown()` to gracefully stop them before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::metrics;
use crate::middleware::TrustResolver;
use crate::ratelimit::{InMemoryRateLimitStore, RateLimitStore};
use crate::registry::NodeRegistry;

/// Shared application state.
///
/// This struct is cloned for each request handler. All internal data
/// is wrapped in `Arc` for efficient sharing.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config, registry);
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Trusted proxy resolver (reloadable)
    pub trust: Arc<TrustResolver>,
    /// Token bucket store shared by all rate limit stages
    pub store: Arc<dyn RateLimitStore>,
    /// Cluster node registry
    pub registry: Arc<dyn NodeRegistry>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create state with the in-process rate limit store.
    ///
    /// Spawns the idle bucket eviction task; must be called inside a Tokio runtime.
    pub fn new(config: Config, registry: Arc<dyn NodeRegistry>) -> Self {
        Self::with_store(config, Arc::new(InMemoryRateLimitStore::new()), registry)
    }

    /// Create state over an explicit rate limit store.
    pub fn with_store(
        config: Config,
        store: Arc<dyn RateLimitStore>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        let trust = Arc::new(TrustResolver::new(&config.trusted_proxies));

        let state = Self {
            config: Arc::new(config),
            trust,
            store,
            registry,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_eviction_task();

        state
    }

    /// Swap in a new trusted proxy list. In-flight requests keep the old snapshot.
    pub fn reload_trusted_proxies(&self, trusted_proxies: &[String]) {
        self.trust.reload(trusted_proxies);
        info!(
            trusted_proxies = self.trust.snapshot().len(),
            "Trusted proxy configuration reloaded"
        );
    }

    /// Spawn the periodic idle bucket sweep.
    ///
    /// The task holds only the store, not the whole state.
    fn spawn_eviction_task(&self) {
        let store = self.store.clone();
        let every = self.config.eviction_interval;
        let retention = self.config.idle_retention;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Eviction task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        evict_idle_buckets(store.as_ref(), retention).await;
                    }
                }
            }

            debug!("Eviction task shutting down");
        });
    }

    /// Spawn the SIGHUP handler that re-reads `TRUSTED_PROXIES` from `.env`
    /// and the environment.
    #[cfg(unix)]
    pub fn spawn_reload_task(&self) {
        let state = self.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut reloads = match crate::utils::reload_signal() {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler, reload disabled");
                    return;
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    received = reloads.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("Received SIGHUP, reloading trusted proxies");
                        state.reload_trusted_proxies(&Config::reload_trusted_proxies());
                    }
                }
            }

            debug!("Reload task shutting down");
        });
    }

    #[cfg(not(unix))]
    pub fn spawn_reload_task(&self) {}

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// One eviction sweep. Store errors are logged; the next tick retries.
async fn evict_idle_buckets(store: &dyn RateLimitStore, retention: Duration) {
    match store.evict_idle(retention).await {
        Ok(0) => trace!("Eviction sweep found no idle buckets"),
        Ok(evicted) => {
            metrics::record_buckets_evicted(evicted as u64);
            info!(evicted, "Evicted idle rate limit buckets");
        }
        Err(e) => error!(error = %e, "Rate limit bucket eviction failed"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::InMemoryNodeRegistry;

    #[tokio::test]
    async fn test_eviction_task_removes_idle_buckets() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let config = Config {
            eviction_interval: Duration::from_millis(20),
            idle_retention: Duration::from_millis(50),
            rate_limit_window: Duration::from_millis(10),
            ..Config::default()
        };
        let state = AppState::with_store(
            config,
            store.clone(),
            Arc::new(InMemoryNodeRegistry::new()),
        );

        state
            .store
            .admit("203.0.113.1", 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(store.contains("203.0.113.1").await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.contains("203.0.113.1").await);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_trusted_proxies_swaps_snapshot() {
        let state = AppState::new(Config::default(), Arc::new(InMemoryNodeRegistry::new()));
        assert!(!state.trust.is_trusted_relay("203.0.113.7"));

        let before = state.trust.snapshot();
        state.reload_trusted_proxies(&["203.0.113.0/24".to_string()]);

        assert!(state.trust.is_trusted_relay("203.0.113.7"));
        assert!(before.is_empty());

        state.reload_trusted_proxies(&[]);
        assert!(!state.trust.is_trusted_relay("203.0.113.7"));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let state = AppState::new(Config::default(), Arc::new(InMemoryNodeRegistry::new()));
        state.spawn_reload_task();
        tokio::time::timeout(Duration::from_secs(5), state.shutdown())
            .await
            .unwrap();
    }
}
