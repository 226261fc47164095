use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

/// The error taxonomy every service operation fails with. Each variant maps
/// to a retry policy and a user-facing behavior; see `is_retryable` and
/// `public_message`.
#[derive(Debug)]
pub enum AppError {
    Validation(String),
    NotFound(String),
    State(String),
    InsufficientBalance { required: Decimal, available: Decimal },
    LedgerTransient(String),
    LedgerFailure(String),
    RateLimited { retry_after_secs: u64 },
    SecurityViolation(String),
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        AppError::State(msg.into())
    }

    /// Retryable kinds per the error taxonomy: transient ledger failures and
    /// unexpected internal faults. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::LedgerTransient(_) | AppError::Internal(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::State(_) => StatusCode::CONFLICT,
            AppError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::LedgerTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::LedgerFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::SecurityViolation(_) => StatusCode::FORBIDDEN,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::State(_) => "STATE_ERROR",
            AppError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            AppError::LedgerTransient(_) => "LEDGER_TRANSIENT",
            AppError::LedgerFailure(_) => "LEDGER_FAILURE",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::SecurityViolation(_) => "SECURITY_VIOLATION",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Sanitized message shown to end users. Secrets, stack traces, and raw
    /// ledger error text never appear here.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("that didn't look right: {msg}"),
            AppError::NotFound(msg) => format!("couldn't find {msg}"),
            AppError::State(msg) => msg.clone(),
            AppError::InsufficientBalance { required, available } => {
                format!("insufficient balance: need {required}, have {available}")
            }
            AppError::LedgerTransient(_) => {
                "the network is busy, please try again in a moment".to_string()
            }
            AppError::LedgerFailure(_) => "the payment could not be completed".to_string(),
            AppError::RateLimited { retry_after_secs } => {
                format!("too many requests, try again in {retry_after_secs}s")
            }
            AppError::SecurityViolation(_) => "request refused".to_string(),
            AppError::Internal(_) => "something went wrong on our end".to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "validation error: {msg}"),
            AppError::NotFound(msg) => write!(f, "not found: {msg}"),
            AppError::State(msg) => write!(f, "state error: {msg}"),
            AppError::InsufficientBalance { required, available } => {
                write!(f, "insufficient balance: required={required} available={available}")
            }
            AppError::LedgerTransient(msg) => write!(f, "ledger transient error: {msg}"),
            AppError::LedgerFailure(msg) => write!(f, "ledger failure: {msg}"),
            AppError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            AppError::SecurityViolation(msg) => write!(f, "security violation: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4();

        match &self {
            AppError::LedgerFailure(_) | AppError::Internal(_) | AppError::SecurityViolation(_) => {
                error!(%correlation_id, error = %self, "request failed");
            }
            AppError::LedgerTransient(_) => {
                tracing::warn!(%correlation_id, error = %self, "ledger call failed transiently");
            }
            _ => {}
        }

        let status = self.status_code();
        let body = json!({
            "error": self.public_message(),
            "code": self.error_code(),
            "correlation_id": correlation_id.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}
