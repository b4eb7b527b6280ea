//! Relay error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vaultsync_core::{AuthError, ValidationError};

/// Relay server error types mapped to HTTP status codes.
#[derive(Debug)]
pub enum RelayError {
    Database(String),
    Auth(AuthError),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge,
    BadRequest(String),
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {}", e),
            Self::Auth(e) => write!(f, "Auth error: {}", e),
            Self::NotFound(e) => write!(f, "Not found: {}", e),
            Self::Conflict(e) => write!(f, "Conflict: {}", e),
            Self::PayloadTooLarge => write!(f, "Payload too large"),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
            Self::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Database(e) | Self::Internal(e) => {
                tracing::error!(error = %e, "Request failed");
                "Internal server error".to_string()
            }
            Self::Auth(e) => e.to_string(),
            Self::NotFound(e) | Self::Conflict(e) | Self::BadRequest(e) => e.clone(),
            Self::PayloadTooLarge => "Payload too large".to_string(),
        };

        let body = serde_json::json!({ "error": message });
        (self.status(), axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        Self::Auth(e)
    }
}

impl From<ValidationError> for RelayError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::TooManyPaths { .. } => Self::PayloadTooLarge,
            other => Self::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            RelayError::Auth(AuthError::KeyRevoked).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::from(ValidationError::EmptyPath).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::from(ValidationError::TooManyPaths { count: 2, max: 1 }).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
