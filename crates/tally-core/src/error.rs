//! # Domain Error Types
//!
//! Error types for the pure sync domain.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CoreError                                       │
//! │                                                                         │
//! │  ┌──────────────────────┐  ┌──────────────────────────────────────┐    │
//! │  │  ValidationError     │  │  UnknownVariant                      │    │
//! │  │  (bad webhook input, │  │  (text in the store that no enum     │    │
//! │  │   bad amounts)       │  │   variant matches)                   │    │
//! │  └──────────────────────┘  └──────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Errors produced by pure domain logic.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed a validation rule.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A stored or received string does not name a known variant.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: String, value: String },
}

impl CoreError {
    /// Creates an UnknownVariant error.
    pub fn unknown(kind: impl Into<String>, value: impl Into<String>) -> Self {
        CoreError::UnknownVariant {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Field-level validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value must not be negative.
    #[error("{field} must not be negative")]
    Negative { field: String },

    /// Invalid format (e.g., malformed email, amount with too many decimals).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
