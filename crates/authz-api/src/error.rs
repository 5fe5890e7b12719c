//! API error handling
//!
//! Maps [`AuthError`] onto HTTP statuses and a stable JSON body. Messages
//! are the error's generic display text; the `required` set of a permission
//! denial and any storage detail never reach the client.
//!
//! Author: hephaex@gmail.com

use authz_core::AuthError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

/// Seconds a client should wait before retrying after a storage outage
const RETRY_AFTER_SECS: &str = "1";

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    Auth(AuthError),
    BadRequest(String),
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(err) => auth_status(err),
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn auth_status(err: &AuthError) -> StatusCode {
    match err {
        AuthError::Unauthenticated | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        AuthError::PermissionDenied { .. } | AuthError::AccessDenied(_) => StatusCode::FORBIDDEN,
        AuthError::DuplicateEmail => StatusCode::CONFLICT,
        AuthError::WeakInput(_) | AuthError::InvalidToken | AuthError::Expired => {
            StatusCode::BAD_REQUEST
        }
        AuthError::NotFound => StatusCode::NOT_FOUND,
        AuthError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::NotificationFailed(_) => StatusCode::BAD_GATEWAY,
        AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn auth_body(err: &AuthError) -> ApiError {
    match err {
        AuthError::Unauthenticated => ApiError::new("UNAUTHENTICATED", err.to_string()),
        AuthError::InvalidCredentials => ApiError::new("INVALID_CREDENTIALS", err.to_string()),
        AuthError::PermissionDenied { .. } => ApiError::new("PERMISSION_DENIED", err.to_string()),
        AuthError::AccessDenied(_) => ApiError::new("ACCESS_DENIED", err.to_string()),
        AuthError::DuplicateEmail => ApiError::new("DUPLICATE_EMAIL", err.to_string()),
        AuthError::WeakInput(_) => ApiError::new("WEAK_INPUT", err.to_string()),
        AuthError::InvalidToken | AuthError::Expired => {
            ApiError::new("INVALID_TOKEN", AuthError::InvalidToken.to_string())
        }
        AuthError::NotFound => ApiError::new("NOT_FOUND", err.to_string()),
        AuthError::StorageUnavailable(_) => ApiError::new(
            "STORAGE_UNAVAILABLE",
            "Service temporarily unavailable, retry later",
        ),
        AuthError::NotificationFailed(msg) => ApiError::new("NOTIFICATION_FAILED", msg.clone()),
        AuthError::Internal(_) => ApiError::internal_error(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Auth(err) => {
                if let AuthError::Internal(detail) = err {
                    error!(error = %detail, "Internal error");
                }
                auth_body(err)
            }
            AppError::BadRequest(msg) => ApiError::bad_request(msg.clone()),
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error");
                ApiError::internal_error()
            }
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Auth(AuthError::WeakInput(err.to_string()))
    }
}
