//! Error handling for the detstream server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::stream_source::StreamError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (session already running or finished)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid feed address or settings
    #[error("Config error: {0}")]
    Config(String),

    /// Feed could not be opened
    #[error("Connect error: {0}")]
    Connect(String),

    /// Feed failed after a successful connect
    #[error("Read error: {0}")]
    Read(String),

    /// Detector call failed
    #[error("Detector error: {0}")]
    Detector(String),

    /// Image encoding failed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Config(msg) => Error::Config(msg),
            StreamError::Connect(msg) => Error::Connect(msg),
            StreamError::Read(msg) => Error::Read(msg),
            StreamError::Stopped => Error::Read("stream stopped".to_string()),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Encode(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "CONFIG_ERROR", msg.clone()),
            Error::Connect(msg) => (StatusCode::BAD_GATEWAY, "CONNECT_ERROR", msg.clone()),
            Error::Read(msg) => (StatusCode::BAD_GATEWAY, "READ_ERROR", msg.clone()),
            Error::Detector(msg) => (StatusCode::BAD_GATEWAY, "DETECTOR_ERROR", msg.clone()),
            Error::Encode(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ENCODE_ERROR",
                msg.clone(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Http(e) => (StatusCode::BAD_GATEWAY, "HTTP_ERROR", e.to_string()),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error_code, message = %message, "Request failed");
        } else {
            tracing::warn!(status = %status, error_code, message = %message, "Request rejected");
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_conversion() {
        let err: Error = StreamError::Config("bad address".to_string()).into();
        assert!(matches!(err, Error::Config(_)));

        let err: Error = StreamError::Connect("refused".to_string()).into();
        assert!(matches!(err, Error::Connect(_)));

        let err: Error = StreamError::Read("eof".to_string()).into();
        assert_eq!(err.to_string(), "Read error: eof");
    }

    #[test]
    fn test_status_codes() {
        let resp = Error::NotFound("sess".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = Error::Config("no scheme".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = Error::Conflict("running".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
