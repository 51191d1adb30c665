//! Rate limit storage backends.
//!
//! The Rate Limiting Stage only talks to [`RateLimitStore`], so the in-process
//! map below can be replaced by a shared backend (needed once several ingress
//! nodes must share one logical limit) without touching the middleware.
//!
//! # Locking
//!
//! ```text
//! admit(existing key) ── read lock on map ── bucket mutex ── done
//! admit(new key)      ── write lock on map ── insert + bucket mutex ── done
//! evict_idle          ── write lock on map ── retain
//! ```
//!
//! Buckets for different keys never contend on the same mutex; the map write
//! lock is only taken for inserts and sweeps.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Admission, TokenBucket};

/// Infrastructure failure of a rate limit backend.
///
/// The Rate Limiting Stage treats every variant as "allow the request".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit store operation failed: {0}")]
    Backend(String),
}

/// Backend owning the `key -> TokenBucket` mapping.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Admit or reject one request for `key`.
    ///
    /// Creates the bucket on first use with `capacity = limit` and
    /// `refill_rate = limit / window`.
    async fn admit(&self, key: &str, limit: u32, window: Duration) -> Result<Admission, StoreError>;

    /// Discard the bucket for `key`; the next request starts at full capacity.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Remove buckets not checked for longer than `older_than`.
    ///
    /// Returns the number of evicted buckets.
    async fn evict_idle(&self, older_than: Duration) -> Result<usize, StoreError>;
}

/// In-process store backed by a `HashMap` behind a read/write lock.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    buckets: RwLock<HashMap<String, TokenBucket>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// [`RateLimitStore::admit`] at an explicit instant.
    pub async fn admit_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> Admission {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(key) {
                return bucket.try_consume_at(now);
            }
        }

        let mut buckets = self.buckets.write().await;
        // Another request may have created it between the two locks
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, limit, window_secs = window.as_secs_f64(), "Creating token bucket");
            TokenBucket::new_at(limit, window, now)
        });
        bucket.try_consume_at(now)
    }

    /// [`RateLimitStore::evict_idle`] at an explicit instant.
    pub async fn evict_idle_at(&self, older_than: Duration, now: Instant) -> usize {
        // Nothing can be idle for longer than the process has been measuring
        let Some(cutoff) = now.checked_sub(older_than) else {
            return 0;
        };

        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_refill() >= cutoff);
        before - buckets.len()
    }

    /// Number of tracked keys.
    pub async fn len(&self) -> usize {
        self.buckets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.read().await.is_empty()
    }

    /// Whether a bucket currently exists for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.buckets.read().await.contains_key(key)
    }

    /// Current balance for `key`, if tracked.
    pub async fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.read().await.get(key).map(TokenBucket::tokens)
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn admit(&self, key: &str, limit: u32, window: Duration) -> Result<Admission, StoreError> {
        Ok(self.admit_at(key, limit, window, Instant::now()).await)
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.buckets.write().await.remove(key);
        Ok(())
    }

    async fn evict_idle(&self, older_than: Duration) -> Result<usize, StoreError> {
        Ok(self.evict_idle_at(older_than, Instant::now()).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_limit_two_per_second() {
        let store = InMemoryRateLimitStore::new();
        let now = Instant::now();

        assert!(store.admit_at("K", 2, WINDOW, now).await.allowed);
        assert!(store.admit_at("K", 2, WINDOW, now).await.allowed);

        let third = store.admit_at("K", 2, WINDOW, now).await;
        assert!(!third.allowed);
        assert_eq!(third.retry_after_secs(), Some(1));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let store = InMemoryRateLimitStore::new();
        let now = Instant::now();

        assert!(store.admit_at("a", 1, WINDOW, now).await.allowed);
        assert!(!store.admit_at("a", 1, WINDOW, now).await.allowed);
        assert!(store.admit_at("b", 1, WINDOW, now).await.allowed);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_reset_restores_full_credit() {
        let store = InMemoryRateLimitStore::new();

        assert!(store.admit("K", 1, Duration::from_secs(3600)).await.unwrap().allowed);
        assert!(!store.admit("K", 1, Duration::from_secs(3600)).await.unwrap().allowed);

        store.reset("K").await.unwrap();
        assert!(!store.contains("K").await);
        assert!(store.admit("K", 1, Duration::from_secs(3600)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_unknown_key_is_noop() {
        let store = InMemoryRateLimitStore::new();
        store.reset("missing").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_evicts_only_idle_buckets() {
        let store = InMemoryRateLimitStore::new();
        let start = Instant::now();
        let retention = Duration::from_secs(3600);

        store.admit_at("idle", 5, WINDOW, start).await;
        store.admit_at("busy", 5, WINDOW, start).await;
        store
            .admit_at("busy", 5, WINDOW, start + Duration::from_secs(3000))
            .await;

        let evicted = store
            .evict_idle_at(retention, start + Duration::from_secs(3601))
            .await;

        assert_eq!(evicted, 1);
        assert!(!store.contains("idle").await);
        assert!(store.contains("busy").await);
    }

    #[tokio::test]
    async fn test_evicted_key_recreated_at_full_capacity() {
        let store = InMemoryRateLimitStore::new();
        let start = Instant::now();

        for _ in 0..3 {
            store.admit_at("K", 3, WINDOW, start).await;
        }
        assert!(!store.admit_at("K", 3, WINDOW, start).await.allowed);

        let later = start + Duration::from_secs(7200);
        assert_eq!(store.evict_idle_at(Duration::from_secs(3600), later).await, 1);

        assert!(store.admit_at("K", 3, WINDOW, later).await.allowed);
        assert!((store.tokens("K").await.unwrap() - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_capacity() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let window = Duration::from_secs(3600);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.admit("shared", 10, window).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().allowed {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(store.len().await, 1);
    }
}
