//! Request ID middleware for distributed tracing.
//!
//! - Propagates an existing `X-Request-Id` header, or generates a UUIDv4
//! - Writes the id back onto the request so later stages can read it
//!   (the S3 `SlowDown` rejection echoes it in `<RequestId>`)
//! - Adds `X-Request-Id` and `x-amz-request-id` to every response
//!
//! Install it outside the rate limiting and cluster authentication layers so
//! their rejections carry the id as well.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Response header S3 clients read the request id from.
pub const AMZ_REQUEST_ID_HEADER: &str = "x-amz-request-id";

/// Longest client-supplied id that is propagated; longer ones are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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
        let request_id = extract_or_generate_request_id(&req);

        req.headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.clone());

        Span::current().record("request_id", request_id.to_str().unwrap_or_default());
        debug!(request_id = ?request_id, "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;

            let headers = response.headers_mut();
            headers.insert(AMZ_REQUEST_ID_HEADER, request_id.clone());
            headers.insert(REQUEST_ID_HEADER, request_id);

            Ok(response)
        })
    }
}

/// Extract request ID from headers or generate a new one.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> HeaderValue {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
    {
        return header_value.clone();
    }

    // A hyphenated UUID is always a valid header value
    HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Extension trait to extract request ID from requests.
pub trait RequestIdExt {
    /// Get the request ID from the request headers.
    fn request_id(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        self.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tower::ServiceExt;

    #[test]
    fn test_extract_existing_request_id() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_or_generate_request_id(&req), "existing-id-123");
    }

    #[test]
    fn test_generate_new_request_id() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = extract_or_generate_request_id(&req);

        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_oversized_request_id_replaced() {
        let req = Request::builder()
            .header("x-request-id", "a".repeat(MAX_REQUEST_ID_LEN + 1))
            .body(Body::empty())
            .unwrap();

        let id = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_request_id_ext_trait() {
        let req = Request::builder()
            .header("x-request-id", "test-id")
            .body(Body::empty())
            .unwrap();

        assert_eq!(req.request_id(), Some("test-id".to_string()));
    }

    #[test]
    fn test_request_id_ext_trait_none() {
        let req = Request::builder().body(Body::empty()).unwrap();

        assert_eq!(req.request_id(), None);
    }

    #[tokio::test]
    async fn test_response_carries_both_headers() {
        let app = Router::new()
            .route(
                "/",
                get(|req: Request<Body>| async move { req.request_id().unwrap_or_default() }),
            )
            .layer(RequestIdLayer::new());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-request-id", "corr-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "corr-7");
        assert_eq!(response.headers()[AMZ_REQUEST_ID_HEADER], "corr-7");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"corr-7");
    }
}
