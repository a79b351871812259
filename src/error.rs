//! Error handling module
//!
//! HTTP-facing error type. Every failure leaves the API as
//! `{"success": false, "error": ..., "code": ...}`.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

use crate::domain::{ErrorKind, LedgerError};

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Audit log error: {0}")]
    Audit(#[from] crate::audit::AuditLogError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Ledger(err) => ledger_status(err),
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Audit(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Ledger(err) => err.code(),
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AppError::Audit(_) => "AUDIT_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::InvalidRequest(rejection.body_text())
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ReconciliationRequired => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Validation => match err {
            LedgerError::AlreadyClaimed(_)
            | LedgerError::IdempotencyConflict { .. }
            | LedgerError::AccountExists(_)
            | LedgerError::InvalidWithdrawalState { .. } => StatusCode::CONFLICT,
            LedgerError::InsufficientBalance { .. }
            | LedgerError::ReferralLimitReached(_)
            | LedgerError::SelfReferral
            | LedgerError::PaymentMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        },
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            AppError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Audit(e) => tracing::error!(error = %e, "Audit log error"),
            AppError::Ledger(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "Ledger store unavailable")
            }
            _ => {}
        }

        // Internals stay in the logs
        let error = match &self {
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            success: false,
            error,
            code: self.code().to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimitExceeded { retry_after } = &self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
