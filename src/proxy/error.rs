//! Error taxonomy for the HTTP surface.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

/// Errors surfaced to the downstream client, always shaped as an Anthropic
/// error envelope (`{"type":"error","error":{"type":..., "message":...}}`).
#[derive(Debug)]
pub enum AppError {
    InvalidRequest(String),
    Authentication(String),
    Upstream(String),
    NotImplemented(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg.as_str())
            }
            AppError::Authentication(msg) => {
                (StatusCode::UNAUTHORIZED, "authentication_error", msg.as_str())
            }
            AppError::Upstream(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error", msg.as_str()),
            AppError::NotImplemented(msg) => {
                (StatusCode::NOT_IMPLEMENTED, "invalid_request_error", msg.as_str())
            }
        }
    }

    /// The same error, shaped as an SSE `error` event rather than an HTTP
    /// response. Used when failure happens mid-stream, after headers are
    /// already committed.
    pub fn to_sse_event(&self) -> String {
        let (_, kind, message) = self.parts();
        let payload = json!({
            "type": "error",
            "error": {"type": kind, "message": message},
        });
        format!("event: error\ndata: {payload}\n\n")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response<Body> {
        let (status, kind, message) = self.parts();

        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                tracing::warn!(status = %status, kind, message, "rejecting request");
            }
            _ => {
                tracing::error!(status = %status, kind, message, "request failed");
            }
        }

        let body = Json(json!({
            "type": "error",
            "error": {"type": kind, "message": message},
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_event_is_well_formed() {
        let err = AppError::Upstream("timed out".to_string());
        let event = err.to_sse_event();
        assert!(event.starts_with("event: error\n"));
        assert!(event.contains("\"type\":\"api_error\""));
        assert!(event.contains("timed out"));
        assert!(event.ends_with("\n\n"));
    }

    #[test]
    fn invalid_request_maps_to_400() {
        let err = AppError::InvalidRequest("bad json".to_string());
        let (status, kind, _) = err.parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(kind, "invalid_request_error");
    }

    #[test]
    fn authentication_maps_to_401() {
        let err = AppError::Authentication("nope".to_string());
        let (status, kind, _) = err.parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(kind, "authentication_error");
    }
}
