//! API errors rendered as `{status, title, body}` messages.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Body shown for internal failures; details stay in the log.
const INTERNAL_ERROR_BODY: &str =
    "Sorry, we encountered an error our end. It has been logged and will be fixed!";

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "Not Found",
            Self::BadRequest(_) => "Bad Request",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Internal(_) => "Failure",
        }
    }

    /// Build the message envelope sent to clients.
    pub fn to_message(&self) -> Message {
        let body = match self {
            Self::NotFound(msg) | Self::BadRequest(msg) | Self::Unauthorized(msg) => msg.clone(),
            Self::Internal(_) => INTERNAL_ERROR_BODY.to_string(),
        };
        Message {
            status: self.status_code().as_u16(),
            title: self.title().to_string(),
            body,
        }
    }
}

/// Uniform message envelope for HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub status: u16,
    pub title: String,
    pub body: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Internal(msg) => {
                error!(status = status.as_u16(), message = %msg, "API error");
            }
            ApiError::Unauthorized(msg) => {
                warn!(status = status.as_u16(), message = %msg, "Rejected request");
            }
            _ => {
                tracing::debug!(status = status.as_u16(), message = %self, "Client error");
            }
        }

        (status, Json(self.to_message())).into_response()
    }
}

/// Convert auth errors to API errors.
impl From<crate::auth::AuthError> for ApiError {
    fn from(err: crate::auth::AuthError) -> Self {
        use crate::auth::AuthError;
        match err {
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader => {
                ApiError::Unauthorized("Missing or invalid authorization".to_string())
            }
            AuthError::InvalidToken(_) => {
                ApiError::Unauthorized("Invalid token, please log in again".to_string())
            }
            AuthError::TokenExpired => {
                ApiError::Unauthorized("Session expired, please log in again".to_string())
            }
            AuthError::InvalidCredentials => {
                ApiError::Unauthorized("Invalid username or password".to_string())
            }
            AuthError::Internal(msg) => {
                ApiError::Internal(format!("Authentication error: {}", msg))
            }
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;

    #[test]
    fn test_error_response_status_codes() {
        assert_eq!(ApiError::not_found("").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::bad_request("").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthorized(String::new()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::Internal(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_message_envelope() {
        let message = ApiError::Unauthorized("Invalid username or password".to_string()).to_message();
        assert_eq!(
            message,
            Message {
                status: 401,
                title: "Unauthorized".to_string(),
                body: "Invalid username or password".to_string(),
            }
        );
    }

    #[test]
    fn test_internal_error_hides_details() {
        let message = ApiError::Internal("db connection reset".to_string()).to_message();
        assert_eq!(message.status, 500);
        assert_eq!(message.title, "Failure");
        assert!(!message.body.contains("db connection"));
    }

    #[test]
    fn test_auth_error_conversion() {
        assert!(matches!(
            ApiError::from(AuthError::TokenExpired),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from(AuthError::Internal("x".to_string())),
            ApiError::Internal(_)
        ));
    }
}
