//! # API Errors
//!
//! One JSON error shape for the webhook and admin routes:
//! `{ "code": "...", "message": "..." }`.
//!
//! ```text
//! ┌──────────────────────────────┬────────┬──────────────────────┐
//! │ SyncError                    │ status │ code                 │
//! ├──────────────────────────────┼────────┼──────────────────────┤
//! │ Validation, Serialization    │ 400    │ validation_error     │
//! │ Token                        │ 401    │ unauthorized         │
//! │ EntityNotFound               │ 404    │ not_found            │
//! │ TenantUnmapped               │ 404    │ tenant_unmapped      │
//! │ Duplicate                    │ 409    │ conflict             │
//! │ AlreadyRunning               │ 409    │ already_running      │
//! │ Remote, Http                 │ 502    │ crm_error            │
//! │ Timeout                      │ 504    │ crm_timeout          │
//! │ everything else              │ 500    │ internal             │
//! └──────────────────────────────┴────────┴──────────────────────┘
//! ```
//!
//! Internal errors are logged with detail and answered with a generic
//! message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::SyncError;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Structured API error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Status and code for a sync error.
pub fn classify(err: &SyncError) -> (StatusCode, &'static str) {
    match err {
        SyncError::Validation(_) | SyncError::SerializationFailed(_) => {
            (StatusCode::BAD_REQUEST, "validation_error")
        }
        SyncError::Token(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
        SyncError::EntityNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        SyncError::TenantUnmapped { .. } => (StatusCode::NOT_FOUND, "tenant_unmapped"),
        SyncError::Duplicate(_) => (StatusCode::CONFLICT, "conflict"),
        SyncError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
        SyncError::Remote { .. } | SyncError::Http(_) => (StatusCode::BAD_GATEWAY, "crm_error"),
        SyncError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "crm_timeout"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let (status, code) = classify(&err);
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %err, "Request failed");
                ApiError::new(status, code, "internal error")
            }
            StatusCode::UNAUTHORIZED => ApiError::new(status, code, "invalid token"),
            _ => ApiError::new(status, code, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_mapping() {
        let cases = [
            (SyncError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (SyncError::Token("expired".into()), StatusCode::UNAUTHORIZED),
            (SyncError::not_found("Customer", "c1"), StatusCode::NOT_FOUND),
            (
                SyncError::TenantUnmapped {
                    business_id: "b1".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (SyncError::AlreadyRunning("Sync processor"), StatusCode::CONFLICT),
            (SyncError::remote(503, "down"), StatusCode::BAD_GATEWAY),
            (SyncError::DatabaseError("locked".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let api = ApiError::from(SyncError::DatabaseError("disk I/O error at /var/db".into()));
        assert_eq!(api.body.code, "internal");
        assert!(!api.body.message.contains("/var/db"));
    }
}
