//! HTTP admission control: every request passes here before business logic.
//!
//! - **Trust Resolver** ([`trust`]): which peers may set forwarded-address headers
//! - **Client Identity** ([`ip`]): spoofing-resistant rate-limit keys
//! - **Rate Limiting** ([`rate_limit`]): token-bucket throttling per key, per API surface
//! - **Cluster Authentication** ([`cluster_auth`]): HMAC-signed inter-node RPC
//! - **Request ID** ([`request_id`]): correlation id propagation
//!
//! # Architecture
//!
//! ```text
//! S3 / public:     Request ID → Rate Limit (ip+operation) ──────────────→ Handler
//!                                    ↓
//!                              503 SlowDown XML
//!
//! Cluster RPC:     Request ID → Cluster Auth → Rate Limit (node) ───────→ Handler
//!                                    ↓                ↓
//!                                401 / 503           429
//! ```

pub mod cluster_auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;
pub mod trust;

pub use cluster_auth::{
    AuthFailure, ClusterAuthLayer, SignedEnvelope, VerifiedNode, compute_signature, sign_request,
};
pub use ip::{KeyExtractor, OperationClass, UNKNOWN_IP, extract_client_ip};
pub use rate_limit::{
    RateLimitConfig, RateLimitError, RateLimitLayer, Rejection, plain_text_rejection,
    s3_slow_down_rejection,
};
pub use request_id::{RequestIdExt, RequestIdLayer};
pub use trust::{CidrRange, TrustResolver, TrustedProxyConfig};
