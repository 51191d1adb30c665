//! Placeholder for the S3-compatible data path.
//!
//! The object storage engine lives outside this service. Requests that pass
//! admission control land here and get an S3 `NotImplemented` error.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;

use crate::error::S3Error;
use crate::middleware::RequestIdExt;
use crate::middleware::ip::request_path;

pub async fn s3_fallback(req: Request<Body>) -> Response {
    let request_id = req.request_id().unwrap_or_default();

    S3Error {
        code: "NotImplemented",
        message: "A header you provided implies functionality that is not implemented.",
        resource: request_path(&req),
        request_id: &request_id,
    }
    .into_response_with(StatusCode::NOT_IMPLEMENTED)
}
