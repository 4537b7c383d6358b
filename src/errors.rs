use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // authentication / authorization
    AuthFailed,
    InvalidToken,
    TokenExpired,
    Forbidden,

    // bad input
    InvalidRequest,
    InvalidUrl,
    UnsupportedFormat,

    // fetch failures
    DownloadFailed,
    DownloadTimeout,
    VideoUnavailable,

    // system
    InternalError,
    ServiceUnavailable,
    RateLimitExceeded,

    // resource
    NotFound,
    AlreadyExists,
    QuotaExceeded,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidUrl => "INVALID_URL",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::DownloadFailed => "DOWNLOAD_FAILED",
            Self::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            Self::VideoUnavailable => "VIDEO_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
        }
    }

    /// Status used when the call site does not override it.
    pub fn default_status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest | Self::InvalidUrl | Self::UnsupportedFormat => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthFailed | Self::InvalidToken | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound | Self::VideoUnavailable => StatusCode::NOT_FOUND,
            Self::AlreadyExists => StatusCode::CONFLICT,
            Self::DownloadFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimitExceeded | Self::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError | Self::DownloadTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error carried through every layer: a fixed kind plus a free-form detail map.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Map<String, Value>,
    status: Option<StatusCode>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            status: None,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.kind.default_status())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn to_body(&self) -> Value {
        json!({
            "error": self.kind.as_str(),
            "message": self.message,
            "details": self.details,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.kind == ErrorKind::InternalError {
            // Collaborator detail stays in the log.
            error!(message = %self.message, details = ?self.details, "Internal error");
            let redacted = AppError::internal("An unexpected error occurred").with_status(status);
            return (status, Json(redacted.to_body())).into_response();
        }
        (status, Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_map_matches_taxonomy() {
        assert_eq!(ErrorKind::InvalidUrl.default_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::TokenExpired.default_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Forbidden.default_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::VideoUnavailable.default_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::AlreadyExists.default_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorKind::DownloadFailed.default_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorKind::QuotaExceeded.default_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorKind::DownloadTimeout.default_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorKind::ServiceUnavailable.default_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn status_override_wins_over_default() {
        let err = AppError::not_found("gone").with_status(StatusCode::GONE);
        assert_eq!(err.status(), StatusCode::GONE);
        assert_eq!(AppError::not_found("x").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn body_has_wire_shape() {
        let body = AppError::new(ErrorKind::InvalidRequest, "Video URL is required")
            .with_detail("field", "url")
            .to_body();
        assert_eq!(body["error"], "INVALID_REQUEST");
        assert_eq!(body["message"], "Video URL is required");
        assert_eq!(body["details"]["field"], "url");
        assert!(body["timestamp"].as_str().is_some());
    }

    #[test]
    fn kind_serializes_as_wire_string() {
        let raw = serde_json::to_string(&ErrorKind::RateLimitExceeded).expect("serialize");
        assert_eq!(raw, "\"RATE_LIMIT_EXCEEDED\"");
        let back: ErrorKind = serde_json::from_str("\"INVALID_URL\"").expect("deserialize");
        assert_eq!(back, ErrorKind::InvalidUrl);
    }
}
