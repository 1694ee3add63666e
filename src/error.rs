use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External call failed: {0}")]
    ExternalCall(#[from] RailError),

    #[error("Confirmation timeout: {0}")]
    ConfirmationTimeout(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Invalid state: {current}, expected: {expected}")]
    InvalidTransition { current: String, expected: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short, payload-free classification used in event descriptions.
    pub fn kind(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("validation: {}", msg),
            AppError::NotFound(_) => "not_found".to_string(),
            AppError::ExternalCall(rail) => format!("external_call: {}", rail.summary()),
            AppError::ConfirmationTimeout(_) => "confirmation_timeout".to_string(),
            AppError::ConcurrencyConflict(_) => "concurrency_conflict".to_string(),
            AppError::InvalidTransition { .. } => "invalid_transition".to_string(),
            AppError::Forbidden(_) => "forbidden".to_string(),
            AppError::Database(_) => "database".to_string(),
            AppError::Config(_) => "config".to_string(),
            AppError::Internal(_) => "internal".to_string(),
        }
    }

    /// Errors that will not go away by retrying the same operation.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Validation(_) | AppError::NotFound(_))
    }
}

/// Errors raised at the boundary of an external rail or contract.
#[derive(Error, Debug, Clone)]
pub enum RailError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request rejected with status {status}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("operation settled as failed: {0}")]
    SettledFailed(String),
}

impl RailError {
    /// Never carries response bodies, safe to persist and expose.
    pub fn summary(&self) -> String {
        match self {
            RailError::Network(_) => "network error".to_string(),
            RailError::Rejected { status, .. } => format!("rejected ({})", status),
            RailError::Decode(_) => "malformed response".to_string(),
            RailError::SettledFailed(_) => "settled as failed".to_string(),
        }
    }
}

impl From<reqwest::Error> for RailError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            RailError::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            RailError::Rejected {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            RailError::Network(error.to_string())
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                msg,
                None,
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                msg,
                None,
            ),
            AppError::InvalidTransition { current, expected } => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Payment is {}, expected {}", current, expected),
                Some(serde_json::json!({
                    "current": current,
                    "expected": expected,
                })),
            ),
            AppError::ConcurrencyConflict(msg) => (
                StatusCode::CONFLICT,
                "CONCURRENCY_CONFLICT",
                msg,
                None,
            ),
            AppError::ExternalCall(rail) => (
                StatusCode::BAD_GATEWAY,
                "EXTERNAL_CALL_FAILED",
                "An upstream provider call failed".to_string(),
                Some(serde_json::json!({ "reason": rail.summary() })),
            ),
            AppError::ConfirmationTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "CONFIRMATION_TIMEOUT",
                "Upstream confirmation did not arrive in time".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Validation(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(error: validator::ValidationErrors) -> Self {
        AppError::Validation(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for adapter calls
pub type RailResult<T> = Result<T, RailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rail_summary_never_leaks_payload() {
        let err = RailError::Rejected {
            status: 422,
            message: "{\"clabe\":\"646180157000000004\",\"secret\":\"x\"}".to_string(),
        };
        assert_eq!(err.summary(), "rejected (422)");
        assert!(!err.to_string().contains("secret"));

        let app: AppError = err.into();
        assert!(!app.kind().contains("clabe"));
    }

    #[test]
    fn permanent_errors_are_classified() {
        assert!(AppError::Validation("x".into()).is_permanent());
        assert!(AppError::NotFound("x".into()).is_permanent());
        assert!(!AppError::ExternalCall(RailError::Network("down".into())).is_permanent());
        assert!(!AppError::ConfirmationTimeout("x".into()).is_permanent());
    }
}
