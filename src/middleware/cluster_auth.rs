//! Mutual authentication for internal cluster RPC.
//!
//! Every peer request carries four headers:
//!
//! | Header      | Value                                   |
//! |-------------|-----------------------------------------|
//! | `Node-ID`   | claimed cluster node identifier         |
//! | `Timestamp` | decimal Unix seconds                    |
//! | `Nonce`     | opaque random string                    |
//! | `Signature` | lowercase hex HMAC-SHA256               |
//!
//! The signature covers `method ∥ path ∥ timestamp ∥ nonce`, keyed by the shared
//! secret the node registry holds for the claimed node. Method and path are not
//! transmitted; they are taken from the live request.
//!
//! # Verification Order
//!
//! ```text
//! headers present? → timestamp parses? → within skew window? → node known? → signature valid?
//!       401               401                  401                 401             401
//! ```
//!
//! Any "no" is terminal. A registry failure or timeout answers `503` and never
//! lets the request through.
//!
//! # Replay
//!
//! Nonces are not recorded. A captured request can be replayed verbatim until
//! its timestamp leaves the skew window.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::InvalidHeaderValue;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::request_path;
use crate::metrics;
use crate::registry::NodeRegistry;

pub const NODE_ID_HEADER: &str = "node-id";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const NONCE_HEADER: &str = "nonce";
pub const SIGNATURE_HEADER: &str = "signature";

/// Largest accepted distance between a request timestamp and local time.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Deadline for one node registry lookup.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(2);

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Signatures
// =============================================================================

/// Hex-encoded HMAC-SHA256 of `method ∥ path ∥ timestamp ∥ nonce` under `secret`.
pub fn compute_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    nonce: &str,
) -> String {
    // HMAC accepts keys of any length; this never takes the else branch
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };

    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of two hex signatures.
fn signatures_match(expected: &str, provided: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

/// Nonce built from the current time in nanoseconds plus 16 random bytes.
pub fn generate_nonce() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let random: [u8; 16] = rand::random();
    format!("{nanos:x}{}", hex::encode(random))
}

/// Sign an outbound peer request with the current time and a fresh nonce.
///
/// Adds the four authentication headers; every other header is left as is.
///
/// # Errors
///
/// Returns an error if `node_id` is not a valid header value.
pub fn sign_request<B>(
    req: &mut Request<B>,
    node_id: &str,
    secret: &str,
) -> Result<(), InvalidHeaderValue> {
    sign_request_at(req, node_id, secret, Utc::now().timestamp(), &generate_nonce())
}

/// [`sign_request`] with an explicit timestamp and nonce.
///
/// # Errors
///
/// Returns an error if `node_id` or `nonce` is not a valid header value.
pub fn sign_request_at<B>(
    req: &mut Request<B>,
    node_id: &str,
    secret: &str,
    timestamp: i64,
    nonce: &str,
) -> Result<(), InvalidHeaderValue> {
    let timestamp = timestamp.to_string();
    let signature = compute_signature(
        secret,
        req.method().as_str(),
        req.uri().path(),
        &timestamp,
        nonce,
    );

    let node_id = HeaderValue::from_str(node_id)?;
    let nonce = HeaderValue::from_str(nonce)?;
    let timestamp = HeaderValue::from_str(&timestamp)?;
    let signature = HeaderValue::from_str(&signature)?;

    let headers = req.headers_mut();
    headers.insert(NODE_ID_HEADER, node_id);
    headers.insert(TIMESTAMP_HEADER, timestamp);
    headers.insert(NONCE_HEADER, nonce);
    headers.insert(SIGNATURE_HEADER, signature);
    Ok(())
}

// =============================================================================
// Failures
// =============================================================================

/// Why a peer request was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("Missing authentication headers")]
    MissingHeaders,

    #[error("Invalid timestamp")]
    InvalidTimestamp,

    #[error("Timestamp skew too large")]
    ClockSkew,

    /// Unknown and removed nodes are reported identically.
    #[error("Node not found")]
    NodeNotFound,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Node registry unavailable")]
    RegistryUnavailable,
}

impl AuthFailure {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Metric label for this failure class.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::MissingHeaders => "missing_headers",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::ClockSkew => "clock_skew",
            Self::NodeNotFound => "node_not_found",
            Self::InvalidSignature => "invalid_signature",
            Self::RegistryUnavailable => "registry_unavailable",
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Identity of the peer that signed the request, attached as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedNode(pub String);

/// The four transmitted values of a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub node_id: String,
    pub timestamp: String,
    pub nonce: String,
    pub signature: String,
}

impl SignedEnvelope {
    /// Read the envelope from request headers. Empty values count as missing.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthFailure> {
        let field = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(AuthFailure::MissingHeaders)
        };

        Ok(Self {
            node_id: field(NODE_ID_HEADER)?,
            timestamp: field(TIMESTAMP_HEADER)?,
            nonce: field(NONCE_HEADER)?,
            signature: field(SIGNATURE_HEADER)?,
        })
    }
}

/// Reject timestamps further than `max_skew` from `now`, in either direction.
fn check_skew(timestamp: i64, now: i64, max_skew: Duration) -> Result<(), AuthFailure> {
    match now.checked_sub(timestamp).map(i64::unsigned_abs) {
        Some(skew) if skew <= max_skew.as_secs() => Ok(()),
        _ => Err(AuthFailure::ClockSkew),
    }
}

// =============================================================================
// Authenticator
// =============================================================================

/// Verifies signed envelopes against the node registry.
pub struct ClusterAuthenticator {
    registry: Arc<dyn NodeRegistry>,
    max_skew: Duration,
    lookup_timeout: Duration,
}

impl ClusterAuthenticator {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self {
            registry,
            max_skew: DEFAULT_MAX_CLOCK_SKEW,
            lookup_timeout: DEFAULT_REGISTRY_TIMEOUT,
        }
    }

    /// Verify `envelope` for a request with `method` and `path` at Unix time `now`.
    ///
    /// # Errors
    ///
    /// Returns the first failed check, in the order listed in the module docs.
    pub async fn verify(
        &self,
        envelope: &SignedEnvelope,
        method: &Method,
        path: &str,
        now: i64,
    ) -> Result<VerifiedNode, AuthFailure> {
        let timestamp: i64 = envelope
            .timestamp
            .parse()
            .map_err(|_| AuthFailure::InvalidTimestamp)?;

        check_skew(timestamp, now, self.max_skew)?;

        let started = Instant::now();
        let lookup = tokio::time::timeout(
            self.lookup_timeout,
            self.registry.find_active_node(&envelope.node_id),
        )
        .await;
        metrics::record_registry_lookup(started.elapsed().as_secs_f64());

        let node = match lookup {
            Ok(Ok(Some(node))) => node,
            Ok(Ok(None)) => return Err(AuthFailure::NodeNotFound),
            Ok(Err(e)) => {
                error!(node_id = %envelope.node_id, error = %e, "Node registry lookup failed");
                return Err(AuthFailure::RegistryUnavailable);
            }
            Err(_) => {
                error!(
                    node_id = %envelope.node_id,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Node registry lookup timed out"
                );
                return Err(AuthFailure::RegistryUnavailable);
            }
        };

        let expected = compute_signature(
            &node.shared_secret,
            method.as_str(),
            path,
            &envelope.timestamp,
            &envelope.nonce,
        );

        if !signatures_match(&expected, &envelope.signature) {
            return Err(AuthFailure::InvalidSignature);
        }

        Ok(VerifiedNode(node.node_id))
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

/// Cluster authentication layer for internal RPC routes.
///
/// # Example
///
/// ```rust,ignore
/// let internal = Router::new()
///     .route("/api/internal/cluster/whoami", get(whoami))
///     .layer(ClusterAuthLayer::new(registry));
/// ```
#[derive(Clone)]
pub struct ClusterAuthLayer {
    authenticator: Arc<ClusterAuthenticator>,
}

impl ClusterAuthLayer {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self {
            authenticator: Arc::new(ClusterAuthenticator::new(registry)),
        }
    }

    /// Builds a layer with explicit skew window and registry deadline.
    pub fn with_settings(
        registry: Arc<dyn NodeRegistry>,
        max_skew: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            authenticator: Arc::new(ClusterAuthenticator {
                registry,
                max_skew,
                lookup_timeout,
            }),
        }
    }
}

impl<S> Layer<S> for ClusterAuthLayer {
    type Service = ClusterAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClusterAuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Cluster authentication service wrapper.
#[derive(Clone)]
pub struct ClusterAuthService<S> {
    inner: S,
    authenticator: Arc<ClusterAuthenticator>,
}

impl<S> Service<Request<Body>> for ClusterAuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let authenticator = self.authenticator.clone();
        let mut inner = self.inner.clone();

        // Owned copies: the request body is not Sync, so nothing borrowed from
        // the request may live across the registry lookup.
        let envelope = SignedEnvelope::from_headers(req.headers());
        let method = req.method().clone();
        let path = request_path(&req).to_string();

        Box::pin(async move {
            let result = match &envelope {
                Ok(envelope) => {
                    authenticator
                        .verify(envelope, &method, &path, Utc::now().timestamp())
                        .await
                }
                Err(failure) => Err(*failure),
            };

            match result {
                Ok(node) => {
                    metrics::record_cluster_auth("authenticated");
                    debug!(node_id = %node.0, path = %path, "Cluster request authenticated");
                    req.extensions_mut().insert(node);
                    inner.call(req).await
                }
                Err(failure) => {
                    metrics::record_cluster_auth(failure.outcome());
                    let node_id = envelope.as_ref().map_or("", |e| e.node_id.as_str());
                    warn!(
                        node_id = %node_id,
                        method = %method,
                        path = %path,
                        reason = %failure,
                        "Cluster authentication rejected"
                    );
                    Ok(failure.into_response())
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryNodeRegistry, NodeEntry, NodeHealth, RegistryError};
    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::Extension;
    use axum::routing::get;
    use tower::ServiceExt;

    const SECRET: &str = "s3cr3t";
    const PATH: &str = "/api/internal/cluster/test";

    fn registry() -> Arc<dyn NodeRegistry> {
        Arc::new(InMemoryNodeRegistry::from_entries([
            NodeEntry::new("N1", SECRET, NodeHealth::Healthy),
            NodeEntry::new("N2", "other", NodeHealth::Degraded),
            NodeEntry::new("N3", "third", NodeHealth::Unavailable),
            NodeEntry::new("gone", "old", NodeHealth::Removed),
        ]))
    }

    fn envelope(node_id: &str, secret: &str, method: &str, ts: i64, nonce: &str) -> SignedEnvelope {
        let timestamp = ts.to_string();
        SignedEnvelope {
            node_id: node_id.to_string(),
            signature: compute_signature(secret, method, PATH, &timestamp, nonce),
            timestamp,
            nonce: nonce.to_string(),
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl NodeRegistry for FailingRegistry {
        async fn find_active_node(&self, _: &str) -> Result<Option<NodeEntry>, RegistryError> {
            Err(RegistryError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowRegistry;

    #[async_trait]
    impl NodeRegistry for SlowRegistry {
        async fn find_active_node(&self, id: &str) -> Result<Option<NodeEntry>, RegistryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(NodeEntry::new(id, SECRET, NodeHealth::Healthy)))
        }
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = compute_signature(SECRET, "GET", PATH, "1700000000", "abc");
        let b = compute_signature(SECRET, "GET", PATH, "1700000000", "abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_changes_with_each_input() {
        let base = compute_signature(SECRET, "GET", PATH, "1700000000", "abc");
        let variants = [
            compute_signature("other", "GET", PATH, "1700000000", "abc"),
            compute_signature(SECRET, "POST", PATH, "1700000000", "abc"),
            compute_signature(SECRET, "GET", "/api/internal/cluster/x", "1700000000", "abc"),
            compute_signature(SECRET, "GET", PATH, "1700000001", "abc"),
            compute_signature(SECRET, "GET", PATH, "1700000000", "abd"),
        ];
        for variant in &variants {
            assert_ne!(&base, variant);
        }
    }

    #[test]
    fn test_envelope_missing_or_empty_header() {
        let mut headers = HeaderMap::new();
        headers.insert(NODE_ID_HEADER, "N1".parse().unwrap());
        headers.insert(TIMESTAMP_HEADER, "1".parse().unwrap());
        headers.insert(NONCE_HEADER, "n".parse().unwrap());
        assert_eq!(
            SignedEnvelope::from_headers(&headers),
            Err(AuthFailure::MissingHeaders)
        );

        headers.insert(SIGNATURE_HEADER, "".parse().unwrap());
        assert_eq!(
            SignedEnvelope::from_headers(&headers),
            Err(AuthFailure::MissingHeaders)
        );

        headers.insert(SIGNATURE_HEADER, "ab".parse().unwrap());
        assert!(SignedEnvelope::from_headers(&headers).is_ok());
    }

    #[tokio::test]
    async fn test_skew_boundary() {
        let auth = ClusterAuthenticator::new(registry());
        let now = 1_700_000_000;

        for offset in [0, 240, -240] {
            let env = envelope("N1", SECRET, "GET", now + offset, "abc");
            assert!(auth.verify(&env, &Method::GET, PATH, now).await.is_ok());
        }

        for offset in [360, -360] {
            let env = envelope("N1", SECRET, "GET", now + offset, "abc");
            assert_eq!(
                auth.verify(&env, &Method::GET, PATH, now).await,
                Err(AuthFailure::ClockSkew)
            );
        }
    }

    #[test]
    fn test_skew_extremes_do_not_overflow() {
        assert_eq!(
            check_skew(i64::MIN, i64::MAX, DEFAULT_MAX_CLOCK_SKEW),
            Err(AuthFailure::ClockSkew)
        );
        assert!(check_skew(300, 0, DEFAULT_MAX_CLOCK_SKEW).is_ok());
        assert!(check_skew(301, 0, DEFAULT_MAX_CLOCK_SKEW).is_err());
    }

    #[tokio::test]
    async fn test_invalid_timestamp() {
        let auth = ClusterAuthenticator::new(registry());
        let mut env = envelope("N1", SECRET, "GET", 0, "abc");
        env.timestamp = "yesterday".to_string();

        assert_eq!(
            auth.verify(&env, &Method::GET, PATH, 0).await,
            Err(AuthFailure::InvalidTimestamp)
        );
    }

    #[tokio::test]
    async fn test_health_filtering() {
        let auth = ClusterAuthenticator::new(registry());
        let now = 1_700_000_000;

        for (id, secret) in [("N1", SECRET), ("N2", "other"), ("N3", "third")] {
            let env = envelope(id, secret, "GET", now, "abc");
            let node = auth.verify(&env, &Method::GET, PATH, now).await.unwrap();
            assert_eq!(node, VerifiedNode(id.to_string()));
        }

        let removed = envelope("gone", "old", "GET", now, "abc");
        let unknown = envelope("nobody", "x", "GET", now, "abc");
        assert_eq!(
            auth.verify(&removed, &Method::GET, PATH, now).await,
            Err(AuthFailure::NodeNotFound)
        );
        assert_eq!(
            auth.verify(&unknown, &Method::GET, PATH, now).await,
            Err(AuthFailure::NodeNotFound)
        );
    }

    #[tokio::test]
    async fn test_signature_mismatch() {
        let auth = ClusterAuthenticator::new(registry());
        let now = 1_700_000_000;

        // Signed as GET, replayed as DELETE
        let env = envelope("N1", SECRET, "GET", now, "abc");
        assert_eq!(
            auth.verify(&env, &Method::DELETE, PATH, now).await,
            Err(AuthFailure::InvalidSignature)
        );

        // Uppercase hex is not the canonical encoding
        let mut upper = envelope("N1", SECRET, "GET", now, "abc");
        upper.signature = upper.signature.to_uppercase();
        assert_eq!(
            auth.verify(&upper, &Method::GET, PATH, now).await,
            Err(AuthFailure::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_registry_errors_fail_closed() {
        let now = 1_700_000_000;
        let env = envelope("N1", SECRET, "GET", now, "abc");

        let failing = ClusterAuthenticator::new(Arc::new(FailingRegistry));
        assert_eq!(
            failing.verify(&env, &Method::GET, PATH, now).await,
            Err(AuthFailure::RegistryUnavailable)
        );

        let slow = ClusterAuthLayer::with_settings(
            Arc::new(SlowRegistry),
            DEFAULT_MAX_CLOCK_SKEW,
            Duration::from_millis(20),
        );
        assert_eq!(
            slow.authenticator.verify(&env, &Method::GET, PATH, now).await,
            Err(AuthFailure::RegistryUnavailable)
        );
    }

    fn app(layer: ClusterAuthLayer) -> Router {
        Router::new()
            .route(
                PATH,
                get(|Extension(node): Extension<VerifiedNode>| async move { node.0 }),
            )
            .layer(layer)
    }

    #[tokio::test]
    async fn test_valid_peer_request_reaches_handler_with_identity() {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(PATH)
            .header("x-request-id", "keep-me")
            .body(Body::empty())
            .unwrap();
        sign_request(&mut req, "N1", SECRET).unwrap();
        assert_eq!(req.headers()["x-request-id"], "keep-me");

        let response = app(ClusterAuthLayer::new(registry()))
            .oneshot(req)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"N1");
    }

    #[tokio::test]
    async fn test_scenario_signature_by_hand() {
        let ts = Utc::now().timestamp().to_string();
        let sig = compute_signature(SECRET, "GET", PATH, &ts, "abc");

        let req = Request::builder()
            .uri(PATH)
            .header("Node-ID", "N1")
            .header("Timestamp", &ts)
            .header("Nonce", "abc")
            .header("Signature", &sig)
            .body(Body::empty())
            .unwrap();

        let response = app(ClusterAuthLayer::new(registry()))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejection_bodies() {
        let app = app(ClusterAuthLayer::new(registry()));

        let response = app
            .clone()
            .oneshot(Request::builder().uri(PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Missing authentication headers");

        let mut req = Request::builder().uri(PATH).body(Body::empty()).unwrap();
        sign_request_at(&mut req, "N1", SECRET, Utc::now().timestamp(), "abc").unwrap();
        req.headers_mut()
            .insert(SIGNATURE_HEADER, HeaderValue::from_static("00"));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Invalid signature");
    }

    #[tokio::test]
    async fn test_registry_outage_returns_503() {
        let mut req = Request::builder().uri(PATH).body(Body::empty()).unwrap();
        sign_request(&mut req, "N1", SECRET).unwrap();

        let response = app(ClusterAuthLayer::new(Arc::new(FailingRegistry)))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(a.len() > 32);
    }

    #[test]
    fn test_sign_rejects_invalid_node_id() {
        let mut req = Request::builder().uri(PATH).body(()).unwrap();
        assert!(sign_request(&mut req, "bad\nid", SECRET).is_err());
        assert!(req.headers().get(SIGNATURE_HEADER).is_none());
    }
}
