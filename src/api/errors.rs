//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.

use crate::errors::LedgerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (INSUFFICIENT_FUNDS, NOT_FOUND, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    BadRequest(String),
    Unauthorized(String),
    /// Failure outside the ledger, such as a lost worker task
    Internal(String),
    /// Business-rule rejection from the ledger
    Ledger(LedgerError),
}

impl ApiError {
    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
        }
    }

    pub fn internal(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Internal(message),
            request_id,
        }
    }

    pub fn ledger(request_id: String, error: LedgerError) -> Self {
        Self {
            kind: ApiErrorKind::Ledger(error),
            request_id,
        }
    }
}

/// HTTP status for each ledger failure
pub fn ledger_status(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::InvalidAmount(_) | LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        LedgerError::PermissionDenied(_) | LedgerError::AccountBanned(_) => StatusCode::FORBIDDEN,
        LedgerError::GameNotFound(_)
        | LedgerError::UserNotFound(_)
        | LedgerError::RequestNotFound(_)
        | LedgerError::MatchNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InvalidRequestState(_)
        | LedgerError::AlreadyClaimed(_)
        | LedgerError::InvalidMatchState(_) => StatusCode::CONFLICT,
        LedgerError::InsufficientFunds { .. }
        | LedgerError::InsufficientCommission { .. }
        | LedgerError::ThresholdNotMet(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::DailyLimitReached { .. } | LedgerError::CooldownActive { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        LedgerError::ExternalProviderError(_) => StatusCode::BAD_GATEWAY,
        LedgerError::Storage(_) | LedgerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Unauthorized(msg) => write!(f, "[{}] Unauthorized: {}", self.request_id, msg),
            ApiErrorKind::Internal(msg) => write!(f, "[{}] Internal: {}", self.request_id, msg),
            ApiErrorKind::Ledger(e) => write!(f, "[{}] {}: {}", self.request_id, e.code(), e),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self.kind {
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),
            ApiErrorKind::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None),
            ApiErrorKind::Internal(msg) => {
                tracing::error!(request_id = %self.request_id, error = %msg, "Request task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                    None,
                )
            }
            ApiErrorKind::Ledger(e) if e.is_internal() => {
                tracing::error!(request_id = %self.request_id, error = %e, "Internal ledger failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                    None,
                )
            }
            ApiErrorKind::Ledger(e) => {
                let details = match e {
                    LedgerError::CooldownActive { retry_after } => {
                        Some(serde_json::json!({ "retry_after": retry_after }))
                    }
                    LedgerError::InsufficientFunds { required, available } => {
                        Some(serde_json::json!({ "required": required, "available": available }))
                    }
                    _ => None,
                };
                (ledger_status(e), e.code(), e.to_string(), details)
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ledger_status(&LedgerError::InsufficientFunds { required: 1, available: 0 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ledger_status(&LedgerError::InvalidRequestState("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ledger_status(&LedgerError::CooldownActive { retry_after: Utc::now() }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ledger_status(&LedgerError::ExternalProviderError("down".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_internal_errors_are_masked() {
        let error = ApiError::ledger(
            "req-1".to_string(),
            crate::errors::StorageError::WriteFailed("disk full".into()).into(),
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let lost = ApiError::internal("req-2".to_string(), "task cancelled".to_string());
        assert_eq!(lost.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
