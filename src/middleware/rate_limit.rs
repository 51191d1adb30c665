//! Rate limiting middleware using per-key token buckets.
//!
//! # Algorithm
//!
//! For every request:
//!
//! 1. Skip predicate matches the path → pass through (health/metrics are never throttled)
//! 2. Derive the client key with the configured [`KeyExtractor`]
//! 3. Ask the [`RateLimitStore`] to admit one request for that key
//! 4. Admitted → forward, add `X-RateLimit-Limit`
//! 5. Rejected → the configured [`RejectionHandler`] builds the response; the
//!    downstream handler is never called
//!
//! A store error or timeout lets the request through (fail open): the storage
//! cluster must stay available when the limiter's backend is not.
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`: configured requests per window, on every throttled-surface response
//! - `X-RateLimit-Remaining`: `0`, on rejection only
//! - `Retry-After`: whole seconds until one token is available, on rejection
//!
//! # Surfaces
//!
//! | Preset                              | Key            | Rejection                |
//! |-------------------------------------|----------------|--------------------------|
//! | [`RateLimitConfig::new`]            | client IP      | `429` plain text         |
//! | [`RateLimitConfig::s3`]             | IP + operation | `503` S3 `SlowDown` XML  |
//! | [`RateLimitConfig::cluster_internal`] | verified node | `429` plain text        |

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::{KeyExtractor, request_path};
use super::request_id::RequestIdExt;
use super::trust::TrustResolver;
use crate::error::S3Error;
use crate::metrics::{self, decision};
use crate::ratelimit::RateLimitStore;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Paths skipped by every preset.
pub const DEFAULT_SKIP_PATHS: [&str; 3] = ["/health", "/ready", "/metrics"];

/// Deadline for one store call before failing open.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Error type for rate limit layer configuration.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit must be greater than 0; leave the layer out to disable limiting")]
    ZeroLimit,

    #[error("rate limit window must be greater than 0")]
    ZeroWindow,

    #[error("key strategy {0:?} reads a client-supplied header and cannot guard a public surface")]
    ClientControlledKey(KeyExtractor),
}

/// Decides whether a request path bypasses rate limiting.
pub type SkipPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Builds the terminal response for a rejected request.
pub type RejectionHandler = Arc<dyn Fn(&Rejection) -> Response<Body> + Send + Sync>;

/// What a [`RejectionHandler`] knows about the rejected request.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub key: String,
    pub path: String,
    pub limit: u32,
    pub retry_after_secs: Option<u64>,
    pub request_id: Option<String>,
}

/// `429 Too Many Requests` with a short text body.
pub fn plain_text_rejection(_: &Rejection) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        "Rate limit exceeded. Please retry later.",
    )
        .into_response()
}

/// `503 Slow Down` with an S3 XML error envelope echoing the request id.
pub fn s3_slow_down_rejection(rejection: &Rejection) -> Response<Body> {
    S3Error {
        code: "SlowDown",
        message: "Please reduce your request rate.",
        resource: &rejection.path,
        request_id: rejection.request_id.as_deref().unwrap_or_default(),
    }
    .into_response_with(StatusCode::SERVICE_UNAVAILABLE)
}

/// Skip predicate matching any of `paths` exactly.
pub fn skip_paths(paths: Vec<String>) -> SkipPredicate {
    Arc::new(move |path: &str| paths.iter().any(|p| p == path))
}

/// Store key for a client key on one surface.
///
/// Surfaces share one store; the prefix keeps a client key that happens to
/// look like another surface's key (`node:<id>` forwarded by a proxy) out of
/// that surface's buckets.
pub fn bucket_key(surface: &str, client_key: &str) -> String {
    format!("{surface}|{client_key}")
}

fn default_skip() -> SkipPredicate {
    skip_paths(DEFAULT_SKIP_PATHS.iter().map(|s| (*s).to_string()).collect())
}

/// Configuration of one Rate Limiting Stage.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Metric label for the protected API surface.
    pub surface: &'static str,
    pub limit: u32,
    pub window: Duration,
    pub key_extractor: KeyExtractor,
    pub skip: SkipPredicate,
    pub on_rejected: RejectionHandler,
    pub store_timeout: Duration,
}

impl RateLimitConfig {
    /// `limit` requests per `window` per client IP, plain text rejections.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            surface: "general",
            limit,
            window,
            key_extractor: KeyExtractor::Ip,
            skip: default_skip(),
            on_rejected: Arc::new(plain_text_rejection),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// S3 data path: reads and writes throttled separately, `SlowDown` XML.
    pub fn s3(limit: u32, window: Duration) -> Self {
        Self {
            surface: "s3",
            key_extractor: KeyExtractor::IpOperation,
            on_rejected: Arc::new(s3_slow_down_rejection),
            ..Self::new(limit, window)
        }
    }

    /// Internal cluster RPC: one budget per authenticated node.
    pub fn cluster_internal(limit: u32, window: Duration) -> Self {
        Self {
            surface: "internal",
            key_extractor: KeyExtractor::Node,
            ..Self::new(limit, window)
        }
    }

    pub fn with_surface(mut self, surface: &'static str) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_key_extractor(mut self, key_extractor: KeyExtractor) -> Self {
        self.key_extractor = key_extractor;
        self
    }

    pub fn with_skip_paths(mut self, paths: Vec<String>) -> Self {
        self.skip = skip_paths(paths);
        self
    }

    pub fn with_skip(mut self, skip: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    pub fn with_rejection_handler(
        mut self,
        handler: impl Fn(&Rejection) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        self.on_rejected = Arc::new(handler);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), RateLimitError> {
        if self.limit == 0 {
            return Err(RateLimitError::ZeroLimit);
        }
        if self.window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        Ok(())
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("surface", &self.surface)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("key_extractor", &self.key_extractor)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RateLimitLayer::new(RateLimitConfig::s3(100, Duration::from_secs(1)), store, trust)?;
/// let app = Router::new()
///     .fallback(s3_handler)
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    config: Arc<RateLimitConfig>,
    store: Arc<dyn RateLimitStore>,
    trust: Arc<TrustResolver>,
}

impl RateLimitLayer {
    /// Create a rate limit layer over a shared store and trust resolver.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if the limit or window is zero.
    pub fn new(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        trust: Arc<TrustResolver>,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            trust,
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            config: self.config.clone(),
            store: self.store.clone(),
            trust: self.trust.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<RateLimitConfig>,
    store: Arc<dyn RateLimitStore>,
    trust: Arc<TrustResolver>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        let store = self.store.clone();
        let mut inner = self.inner.clone();

        let path = request_path(&req).to_string();
        if (config.skip)(&path) {
            metrics::record_rate_limit_decision(config.surface, decision::SKIPPED);
            return Box::pin(async move { inner.call(req).await });
        }

        // Everything needed from the request is extracted before the first await
        let key = config.key_extractor.extract_key(&req, &self.trust);
        let request_id = req.request_id();

        Box::pin(async move {
            let limit_header = HeaderValue::from(config.limit);

            let bucket = bucket_key(config.surface, &key);
            let admission = tokio::time::timeout(
                config.store_timeout,
                store.admit(&bucket, config.limit, config.window),
            )
            .await;

            let admission = match admission {
                Ok(Ok(admission)) => Some(admission),
                Ok(Err(e)) => {
                    error!(surface = config.surface, client_key = %key, error = %e,
                        "Rate limit store failed, allowing request");
                    None
                }
                Err(_) => {
                    error!(surface = config.surface, client_key = %key,
                        "Rate limit store timed out, allowing request");
                    None
                }
            };

            match admission {
                Some(admission) if !admission.allowed => {
                    metrics::record_rate_limit_decision(config.surface, decision::REJECTED);
                    let retry_after_secs = admission.retry_after_secs();

                    warn!(
                        surface = config.surface,
                        client_key = %key,
                        path = %path,
                        retry_after_secs = ?retry_after_secs,
                        "Rate limit exceeded"
                    );

                    let rejection = Rejection {
                        key,
                        path,
                        limit: config.limit,
                        retry_after_secs,
                        request_id,
                    };
                    let mut response = (config.on_rejected)(&rejection);

                    let headers = response.headers_mut();
                    headers.insert(RATE_LIMIT_LIMIT_HEADER, limit_header);
                    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(0u32));
                    if let Some(secs) = retry_after_secs {
                        headers.insert(RETRY_AFTER_HEADER, HeaderValue::from(secs));
                    }
                    Ok(response)
                }
                admission => {
                    if admission.is_some() {
                        metrics::record_rate_limit_decision(config.surface, decision::ALLOWED);
                        debug!(surface = config.surface, client_key = %key, "Request admitted");
                    } else {
                        metrics::record_rate_limit_store_error(config.surface);
                        metrics::record_rate_limit_decision(config.surface, decision::FAIL_OPEN);
                    }

                    let mut response = inner.call(req).await?;
                    response
                        .headers_mut()
                        .insert(RATE_LIMIT_LIMIT_HEADER, limit_header);
                    Ok(response)
                }
            }
        })
    }
}
