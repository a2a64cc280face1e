//! Response helpers and request body handling

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

use crate::playback::ProxyBody;
use crate::{ProxyError, Result};

/// Boxed error accepted from request bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body holding a complete buffer
#[must_use]
pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Empty body
#[must_use]
pub fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text response with the given status
#[must_use]
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Status code reported to the client for an error
#[must_use]
pub fn error_status(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        ProxyError::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Create an error response
#[must_use]
pub fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = error_status(error);
    if status == StatusCode::NOT_FOUND {
        let mut response = Response::new(empty());
        *response.status_mut() = status;
        return response;
    }
    text_response(status, &format!("Error: {error}"))
}

/// Read a request body with a size limit
///
/// # Errors
///
/// Returns error if the body is too large or cannot be read
pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: Into<BoxError>,
{
    let limited = http_body_util::Limited::new(body, max_size);
    let collected = limited
        .collect()
        .await
        .map_err(|e| ProxyError::Http(format!("Failed to read body: {e}")))?;

    Ok(collected.to_bytes())
}
