//! Application routing: which admission stages guard which API surface.
//!
//! # Middleware Stack
//!
//! ```text
//!                         Request
//!                            │
//!                  ┌─────────▼─────────┐
//!                  │    Request ID     │ ← X-Request-Id / x-amz-request-id
//!                  └─────────┬─────────┘
//!                  ┌─────────▼─────────┐
//!                  │      Tracing      │ ← HTTP request/response spans
//!                  └─────────┬─────────┘
//!          ┌─────────────────┼──────────────────────┐
//!          │                 │                      │
//!   /health, /ready   /api/internal/cluster/*    everything else
//!          │                 │                      │
//!          │       ┌─────────▼─────────┐  ┌─────────▼─────────┐
//!          │       │   Cluster Auth    │  │ Rate Limit (S3)   │ ← 503 SlowDown
//!          │       └─────────┬─────────┘  └─────────┬─────────┘
//!          │       ┌─────────▼─────────┐            │
//!          │       │ Rate Limit (node) │ ← 429      │
//!          │       └─────────┬─────────┘            │
//!          ▼                 ▼                      ▼
//!      Handler        Cluster handler        S3 placeholder
//! ```
//!
//! Surfaces are separate routers merged with full paths, so the path a peer
//! signs is exactly the path cluster authentication verifies.

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{
    ClusterAuthLayer, RateLimitConfig, RateLimitError, RateLimitLayer, RequestIdLayer,
};
use crate::state::AppState;

/// Path prefix of inter-node RPC routes.
pub const INTERNAL_CLUSTER_PREFIX: &str = "/api/internal/cluster";

/// Build the application router with all routes and middleware configured.
///
/// - **S3 rate limiting**: Enabled if `rate_limit_requests > 0`
/// - **Cluster rate limiting**: Enabled if `internal_rate_limit_requests > 0`
/// - **Cluster authentication**: Always on for `/api/internal/cluster/*`
///
/// # Errors
///
/// Returns `RateLimitError` if rate limiting configuration is invalid, including
/// an S3 key strategy that reads a client-supplied header.
pub fn build_router(state: AppState) -> Result<Router, RateLimitError> {
    let config = &state.config;

    // =========================================================================
    // Operational endpoints (never throttled, never authenticated)
    // =========================================================================
    let ops = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    // =========================================================================
    // Internal cluster RPC
    // =========================================================================
    let mut internal = Router::new()
        .route(
            &format!("{INTERNAL_CLUSTER_PREFIX}/whoami"),
            get(handlers::whoami),
        )
        // Unknown internal paths still authenticate before answering 404
        .route(
            &format!("{INTERNAL_CLUSTER_PREFIX}/{{*rest}}"),
            any(|| async { StatusCode::NOT_FOUND }),
        );

    // Layers added later run first: authentication, then the per-node limit
    if config.internal_rate_limiting_enabled() {
        info!(
            requests = config.internal_rate_limit_requests,
            window_secs = config.rate_limit_window.as_secs(),
            "Cluster RPC rate limiting enabled"
        );
        internal = internal.layer(RateLimitLayer::new(
            RateLimitConfig::cluster_internal(
                config.internal_rate_limit_requests,
                config.rate_limit_window,
            )
            .with_skip_paths(config.rate_limit_skip_paths.clone()),
            state.store.clone(),
            state.trust.clone(),
        )?);
    } else {
        info!("Cluster RPC rate limiting disabled (INTERNAL_RATE_LIMIT_REQUESTS=0)");
    }

    info!(
        max_skew_secs = config.cluster_auth_max_skew.as_secs(),
        registry_timeout_ms = config.registry_timeout.as_millis() as u64,
        "Cluster authentication enabled"
    );
    internal = internal.layer(ClusterAuthLayer::with_settings(
        state.registry.clone(),
        config.cluster_auth_max_skew,
        config.registry_timeout,
    ));

    // =========================================================================
    // S3-compatible data path
    // =========================================================================
    let mut s3 = Router::new().fallback(handlers::s3_fallback);

    if config.rate_limiting_enabled() {
        if config.rate_limit_key_strategy.is_client_controlled() {
            return Err(RateLimitError::ClientControlledKey(
                config.rate_limit_key_strategy,
            ));
        }

        info!(
            requests = config.rate_limit_requests,
            window_secs = config.rate_limit_window.as_secs(),
            key_strategy = ?config.rate_limit_key_strategy,
            trusted_proxies = config.trusted_proxies.len(),
            "S3 rate limiting enabled"
        );
        s3 = s3.layer(RateLimitLayer::new(
            RateLimitConfig::s3(config.rate_limit_requests, config.rate_limit_window)
                .with_key_extractor(config.rate_limit_key_strategy)
                .with_skip_paths(config.rate_limit_skip_paths.clone()),
            state.store.clone(),
            state.trust.clone(),
        )?);
    } else {
        info!("S3 rate limiting disabled (RATE_LIMIT_REQUESTS=0)");
    }

    // =========================================================================
    // Shared middleware (order matters - applied bottom to top)
    // =========================================================================
    let router = ops
        .merge(internal)
        .merge(s3)
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new());

    Ok(router.with_state(state))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::middleware::{KeyExtractor, sign_request};
    use crate::registry::{InMemoryNodeRegistry, NodeEntry, NodeHealth};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Method, Request};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(config: Config) -> AppState {
        let registry = InMemoryNodeRegistry::from_entries([
            NodeEntry::new("storage-1", "secret-1", NodeHealth::Healthy),
            NodeEntry::new("storage-9", "secret-9", NodeHealth::Removed),
        ]);
        AppState::new(config, Arc::new(registry))
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        let addr: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        Request::builder()
            .method(method)
            .uri(path)
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_never_throttled() {
        let config = Config {
            rate_limit_requests: 1,
            ..Config::default()
        };
        let app = build_router(state(config)).unwrap();

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/health"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-request-id").is_some());
        }
    }

    #[tokio::test]
    async fn test_s3_fallback_is_rate_limited() {
        let config = Config {
            rate_limit_requests: 2,
            rate_limit_window: Duration::from_secs(60),
            ..Config::default()
        };
        let app = build_router(state(config)).unwrap();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(Method::GET, "/photos/cat.jpg"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        }

        let response = app
            .oneshot(request(Method::GET, "/photos/cat.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let request_id = response.headers()["x-amz-request-id"].to_str().unwrap().to_string();
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("<Code>SlowDown</Code>"));
        assert!(body.contains(&format!("<RequestId>{request_id}</RequestId>")));
    }

    #[tokio::test]
    async fn test_internal_routes_require_signature() {
        let app = build_router(state(Config::default())).unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/internal/cluster/whoami"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request(Method::POST, "/api/internal/cluster/replicate"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signed_whoami() {
        let app = build_router(state(Config::default())).unwrap();

        let mut req = request(Method::GET, "/api/internal/cluster/whoami");
        sign_request(&mut req, "storage-1", "secret-1").unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1000");

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["node_id"], "storage-1");

        let mut req = request(Method::GET, "/api/internal/cluster/whoami");
        sign_request(&mut req, "storage-9", "secret-9").unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_internal_rate_limit_keys_by_node() {
        let config = Config {
            internal_rate_limit_requests: 1,
            rate_limit_window: Duration::from_secs(60),
            ..Config::default()
        };
        let app = build_router(state(config)).unwrap();

        let mut first = request(Method::GET, "/api/internal/cluster/whoami");
        sign_request(&mut first, "storage-1", "secret-1").unwrap();
        assert_eq!(app.clone().oneshot(first).await.unwrap().status(), StatusCode::OK);

        let mut second = request(Method::GET, "/api/internal/cluster/whoami");
        sign_request(&mut second, "storage-1", "secret-1").unwrap();
        assert_eq!(
            app.oneshot(second).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_s3_traffic_cannot_drain_node_budget() {
        let config = Config {
            rate_limit_requests: 1,
            internal_rate_limit_requests: 1000,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_key_strategy: KeyExtractor::Ip,
            ..Config::default()
        };
        let app = build_router(state(config)).unwrap();

        // A client behind a private proxy forwards a key shaped like a node key
        let proxy: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let forged = Request::builder()
            .uri("/bucket/obj")
            .header("x-forwarded-for", "node:storage-1")
            .extension(ConnectInfo(proxy))
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(forged).await.unwrap().status(),
            StatusCode::NOT_IMPLEMENTED
        );

        let mut req = request(Method::GET, "/api/internal/cluster/whoami");
        sign_request(&mut req, "storage-1", "secret-1").unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
    }

    #[tokio::test]
    async fn test_s3_surface_refuses_user_key_strategy() {
        let config = Config {
            rate_limit_key_strategy: KeyExtractor::User,
            ..Config::default()
        };

        let err = build_router(state(config)).unwrap_err();
        assert_eq!(err, RateLimitError::ClientControlledKey(KeyExtractor::User));
    }

    #[tokio::test]
    async fn test_disabled_limits_build() {
        let config = Config {
            rate_limit_requests: 0,
            internal_rate_limit_requests: 0,
            ..Config::default()
        };
        let app = build_router(state(config)).unwrap();

        let response = app.oneshot(request(Method::PUT, "/bucket/key")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}
