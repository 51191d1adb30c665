use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use thiserror::Error;

/// Application-wide error types.
///
/// Admission decisions (rate-limit rejections, cluster authentication
/// failures) are not errors of this type; the middleware renders them itself.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// S3 Error Envelope
// =============================================================================

/// An S3-style `<Error>` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Error<'a> {
    pub code: &'a str,
    pub message: &'a str,
    pub resource: &'a str,
    pub request_id: &'a str,
}

impl S3Error<'_> {
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Error><Code>{}</Code><Message>{}</Message><Resource>{}</Resource><RequestId>{}</RequestId></Error>",
            xml_escape(self.code),
            xml_escape(self.message),
            xml_escape(self.resource),
            xml_escape(self.request_id),
        )
    }

    /// Render with `status` and an `application/xml` content type.
    pub fn into_response_with(self, status: StatusCode) -> Response<Body> {
        (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
            self.to_xml(),
        )
            .into_response()
    }
}

/// Escape the five XML special characters.
pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
