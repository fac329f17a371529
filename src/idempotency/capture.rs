use crate::error::{AppError, Result};
use crate::idempotency::cache::CachedResponse;
use axum::body::{Body, Bytes};
use axum::response::Response;
use http::header::CONTENT_TYPE;
use http::response::Parts;
use http::StatusCode;

/// Records a downstream response while handing it on unchanged.
///
/// The body is drained into a buffer once the handler has finished; status
/// and headers are read from the response itself when a snapshot is taken,
/// so whatever the handler set last is what gets cached.
pub struct ResponseCapture {
    parts: Parts,
    body: Bytes,
}

impl ResponseCapture {
    /// Drains `response`'s body. A body that fails mid-stream is a handler
    /// failure and is returned as an error.
    pub async fn capture(response: Response) -> Result<Self> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to read response body: {}", e)))?;

        Ok(Self { parts, body })
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The response's declared content type, or an empty string.
    pub fn content_type(&self) -> String {
        self.parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// Snapshots status, a copy of the headers, and the buffered body.
    pub fn to_cached_response(&self, content_type: &str) -> CachedResponse {
        CachedResponse::new(self.parts.status, content_type, &self.parts.headers, self.body.to_vec())
    }

    /// Forwards the recorded response to the client.
    pub fn into_response(self) -> Response {
        Response::from_parts(self.parts, Body::from(self.body))
    }
}
