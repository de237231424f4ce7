//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transient     │  │     Semantic            │ │
//! │  │  (terminal)     │  │   (retryable)   │  │     (terminal)          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Http           │  │  EntityNotFound         │ │
//! │  │  TenantUnmapped │  │  Timeout        │  │  Validation             │ │
//! │  │  Token          │  │  Remote 5xx/429 │  │  Duplicate              │ │
//! │  │                 │  │  DatabaseError  │  │  Remote 400/404/409/422 │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  A customer that isn't synced yet is not an error at all: the         │
//! │  scheduler turns it into a dependency wait. A customer that failed     │
//! │  for good is DependencyFailed (terminal) for everything that needs it. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Retryability is decided where the error is built (mostly the CRM
//! adapter), never by matching on message text.

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// HTTP statuses that retrying cannot fix.
const NON_RETRYABLE_STATUSES: [u16; 6] = [400, 401, 403, 404, 409, 422];

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid CRM URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// The business has no CRM tenant id.
    #[error("Business {business_id} is not mapped to a CRM tenant")]
    TenantUnmapped { business_id: String },

    /// Failed to mint or verify a token.
    #[error("Token error: {0}")]
    Token(String),

    // =========================================================================
    // Remote / Transport Errors
    // =========================================================================
    /// The CRM answered with a non-2xx status.
    #[error("CRM returned HTTP {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// Connection-level failure (DNS, refused, reset, bad body).
    #[error("HTTP transport error: {0}")]
    Http(String),

    /// The CRM did not answer in time.
    #[error("Request timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Semantic Errors
    // =========================================================================
    /// A referenced local entity does not exist.
    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: String, id: String },

    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The customer an entity depends on failed to sync and nothing is
    /// queued to try again.
    #[error("Customer {customer_id} failed to sync")]
    DependencyFailed { customer_id: String },

    /// The write would duplicate an existing record.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Failed to (de)serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// A single-flight guard is already held.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Internal sync error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Constructors
// =============================================================================

impl SyncError {
    /// Builds a `Remote` error, classifying the status.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        SyncError::Remote {
            status,
            message: message.into(),
            retryable: !NON_RETRYABLE_STATUSES.contains(&status),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::EntityNotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        use tally_db::DbError;
        match err {
            DbError::NotFound { entity, id } => SyncError::EntityNotFound { entity, id },
            DbError::UniqueViolation { field, value } => {
                SyncError::Duplicate(format!("{field} = '{value}'"))
            }
            other if other.is_transient() => SyncError::DatabaseError(other.to_string()),
            other => SyncError::Internal(format!("database: {other}")),
        }
    }
}

impl From<tally_core::ValidationError> for SyncError {
    fn from(err: tally_core::ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::remote(status.as_u16(), err.to_string())
        } else {
            SyncError::Http(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for SyncError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        SyncError::Token(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if retrying the same operation later may succeed.
    ///
    /// ## Retryable Errors
    /// - Transport failures and timeouts
    /// - CRM statuses outside 400/401/403/404/409/422 (5xx, 429, ...)
    /// - Transient database errors (locked file, exhausted pool)
    ///
    /// ## Non-Retryable Errors
    /// - Unmapped tenant, bad config, token failures
    /// - Missing entity, validation, duplicate
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { retryable, .. } => *retryable,
            SyncError::Http(_) | SyncError::Timeout(_) | SyncError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// HTTP status of a remote failure, for the audit ledger.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            SyncError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_classification() {
        for status in [500, 502, 503, 504, 429, 408] {
            assert!(SyncError::remote(status, "x").is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!SyncError::remote(status, "x").is_retryable(), "{status}");
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Http("connection refused".into()).is_retryable());
        assert!(SyncError::Timeout("30s".into()).is_retryable());

        assert!(!SyncError::TenantUnmapped { business_id: "b".into() }.is_retryable());
        assert!(!SyncError::not_found("Customer", "c1").is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
        assert!(!SyncError::Duplicate("email".into()).is_retryable());
        assert!(!SyncError::DependencyFailed { customer_id: "c1".into() }.is_retryable());
    }

    #[test]
    fn test_db_error_mapping() {
        let err: SyncError = tally_db::DbError::not_found("Transaction", "t1").into();
        assert!(matches!(err, SyncError::EntityNotFound { .. }));
        assert!(!err.is_retryable());

        let err: SyncError = tally_db::DbError::duplicate("email", "a@b.co").into();
        assert!(matches!(err, SyncError::Duplicate(_)));

        let err: SyncError = tally_db::DbError::PoolExhausted.into();
        assert!(err.is_retryable());

        let err: SyncError = tally_db::DbError::Decode("bad status".into()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::remote(503, "upstream unavailable");
        assert!(err.to_string().contains("503"));
        assert_eq!(err.http_status(), Some(503));
        assert!(SyncError::AlreadyRunning("Sync processor")
            .to_string()
            .contains("already running"));
    }
}
