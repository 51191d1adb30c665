//! Client identity extraction for rate limiting.
//!
//! Every rate-limited request is reduced to a string key. The base of every key
//! is the client IP, derived with the following rules:
//!
//! 1. Start from the direct peer address (`ConnectInfo`), port stripped.
//! 2. If the peer is **not** a trusted relay, that address is the answer.
//!    Forwarded headers from untrusted origins are ignored entirely.
//! 3. If the peer is a trusted relay, prefer the first entry of
//!    `X-Forwarded-For`, then `X-Real-IP`, then the peer address itself.
//!
//! # Why Rule 2 Matters
//!
//! Without it any internet client can set `X-Forwarded-For` to a random value
//! per request and never exhaust a bucket, or set it to a victim's address and
//! exhaust theirs. Trust is decided by [`TrustResolver`], never by the request.
//!
//! # Composite Keys
//!
//! [`KeyExtractor`] layers finer-grained isolation on top of the IP key:
//!
//! ```text
//! Ip           203.0.113.9
//! User         user:alice             (falls back to Ip)
//! IpPath       203.0.113.9:/bucket/key
//! IpMethod     203.0.113.9:PUT
//! IpOperation  203.0.113.9:write
//! Node         node:storage-2         (falls back to Ip)
//! ```

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, OriginalUri};
use axum::http::{HeaderMap, Method, Request};
use tracing::debug;

use super::cluster_auth::VerifiedNode;
use super::trust::TrustResolver;

/// Fallback key when the request carries no peer address at all.
///
/// This only happens when the router is served without
/// `into_make_service_with_connect_info`; all such requests share one bucket.
pub const UNKNOWN_IP: &str = "unknown";

/// Header carrying the authenticated user, set by the upstream identity layer.
///
/// Only deploy [`KeyExtractor::User`] behind a stage that strips client-supplied
/// values of this header.
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

// =============================================================================
// Private Helpers
// =============================================================================

/// Result of extracting IP from headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    /// IP extracted from X-Forwarded-For header (first IP in the list).
    FromXff(&'a str),
    /// IP extracted from X-Real-IP header.
    FromRealIp(&'a str),
    /// No usable IP headers found.
    NotFound,
}

/// Extract the forwarded client address from request headers.
///
/// `X-Forwarded-For` is `client, proxy1, proxy2`: each hop appends the address
/// it received from, so the leftmost entry is the original client. Empty
/// entries are skipped over to the next header.
#[inline]
fn extract_ip_from_headers(headers: &HeaderMap) -> ExtractedIp<'_> {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

// =============================================================================
// Public API
// =============================================================================

/// Strip the port from `host:port` or `[v6addr]:port`.
///
/// Bare IPv4 addresses, bare IPv6 addresses and the empty string are returned
/// unchanged.
pub fn strip_port(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, _)) => host,
            None => address,
        };
    }

    match address.split_once(':') {
        // Exactly one colon: host:port. More than one: a bare IPv6 address.
        Some((host, port)) if !port.contains(':') => host,
        _ => address,
    }
}

/// The direct peer address of a request, port stripped.
///
/// Returns [`UNKNOWN_IP`] when no `ConnectInfo` is attached.
pub fn peer_address<B>(req: &Request<B>) -> Cow<'static, str> {
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => Cow::Owned(strip_port(&addr.to_string()).to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// The request path as the client sent it, before any router nesting.
pub fn request_path<B>(req: &Request<B>) -> &str {
    req.extensions()
        .get::<OriginalUri>()
        .map_or_else(|| req.uri().path(), |uri| uri.0.path())
}

/// Resolve the client IP for a peer address and its request headers.
///
/// `peer` may carry a port. An empty `peer` yields an empty key.
pub fn resolve_client_ip(peer: &str, headers: &HeaderMap, trust: &TrustResolver) -> String {
    if peer.is_empty() {
        return String::new();
    }

    let peer = strip_port(peer);

    if !trust.is_trusted_relay(peer) {
        if headers.contains_key("x-forwarded-for") || headers.contains_key("x-real-ip") {
            debug!(peer = %peer, "Ignoring forwarded address headers from untrusted peer");
        }
        return peer.to_string();
    }

    match extract_ip_from_headers(headers) {
        ExtractedIp::FromXff(ip) => {
            debug!(peer = %peer, client_ip = %ip, "Client IP taken from X-Forwarded-For");
            ip.to_string()
        }
        ExtractedIp::FromRealIp(ip) => {
            debug!(peer = %peer, client_ip = %ip, "Client IP taken from X-Real-IP");
            ip.to_string()
        }
        ExtractedIp::NotFound => peer.to_string(),
    }
}

/// IP-based client key for a request.
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>, trust: &TrustResolver) -> String {
    resolve_client_ip(&peer_address(req), req.headers(), trust)
}

/// Coarse operation class of an HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Read,
    Write,
    Delete,
}

impl OperationClass {
    /// Classify a method: safe methods read, `DELETE` deletes, the rest write.
    pub fn of(method: &Method) -> Self {
        if method.is_safe() {
            Self::Read
        } else if *method == Method::DELETE {
            Self::Delete
        } else {
            Self::Write
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy for deriving a rate-limit key from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyExtractor {
    /// Client IP.
    #[default]
    Ip,
    /// `user:<name>` from [`AUTHENTICATED_USER_HEADER`], else client IP.
    User,
    /// Client IP and request path.
    IpPath,
    /// Client IP and HTTP method.
    IpMethod,
    /// Client IP and [`OperationClass`].
    IpOperation,
    /// `node:<id>` from a [`VerifiedNode`] extension, else client IP.
    Node,
}

impl KeyExtractor {
    /// Whether the key comes from a header any client can set.
    ///
    /// Such strategies are only sound behind a layer that overwrites the header.
    pub fn is_client_controlled(&self) -> bool {
        matches!(self, Self::User)
    }

    /// Parse a strategy name as used in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ip" => Some(Self::Ip),
            "user" => Some(Self::User),
            "ip_path" => Some(Self::IpPath),
            "ip_method" => Some(Self::IpMethod),
            "ip_operation" => Some(Self::IpOperation),
            "node" => Some(Self::Node),
            _ => None,
        }
    }

    /// Derive the rate-limit key for `req`.
    pub fn extract_key<B>(&self, req: &Request<B>, trust: &TrustResolver) -> String {
        match self {
            Self::Ip => extract_client_ip(req, trust),
            Self::User => match req
                .headers()
                .get(AUTHENTICATED_USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                Some(user) => format!("user:{user}"),
                None => extract_client_ip(req, trust),
            },
            Self::IpPath => format!("{}:{}", extract_client_ip(req, trust), request_path(req)),
            Self::IpMethod => format!("{}:{}", extract_client_ip(req, trust), req.method()),
            Self::IpOperation => format!(
                "{}:{}",
                extract_client_ip(req, trust),
                OperationClass::of(req.method())
            ),
            Self::Node => match req.extensions().get::<VerifiedNode>() {
                Some(node) => format!("node:{}", node.0),
                None => extract_client_ip(req, trust),
            },
        }
    }
}
