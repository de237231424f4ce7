//! # Validation Module
//!
//! Input validation for data arriving from the CRM.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Webhook handler (axum)                                       │
//! │  ├── JSON shape (deserialization)                                      │
//! │  └── Required ids present                                              │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Email / phone normalization                                       │
//! │  └── Non-negative loyalty balances                                     │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL / CHECK constraints                                      │
//! │  └── Partial UNIQUE index on the active queue                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{normalize_email, normalize_phone};
//!
//! assert_eq!(normalize_email(" Ada@Example.com ").unwrap(), "ada@example.com");
//! assert_eq!(normalize_phone("(555) 010-2030").unwrap(), "5550102030");
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 254;

// =============================================================================
// Identifiers
// =============================================================================

/// Returns the trimmed value, or `Required` when it is missing or blank.
pub fn require<'a>(field: &str, value: Option<&'a str>) -> ValidationResult<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::Required {
            field: field.to_string(),
        }),
    }
}

// =============================================================================
// Contact Fields
// =============================================================================

/// Validates and lowercases an email address.
///
/// ## Rules
/// - Exactly one `@` with a non-empty local part
/// - Domain contains a dot that is not at either end
/// - At most 254 characters
pub fn normalize_email(email: &str) -> ValidationResult<String> {
    let email = email.trim().to_lowercase();
    let invalid = |reason: &str| ValidationError::InvalidFormat {
        field: "email".to_string(),
        reason: reason.to_string(),
    };

    if email.is_empty() {
        return Err(ValidationError::Required {
            field: "email".to_string(),
        });
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(ValidationError::TooLong {
            field: "email".to_string(),
            max: MAX_EMAIL_LEN,
        });
    }

    let (local, domain) = email
        .split_once('@')
        .ok_or_else(|| invalid("missing @"))?;

    if local.is_empty() || domain.contains('@') {
        return Err(invalid("expected exactly one @ with a local part"));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid("domain must contain a dot"));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain whitespace"));
    }

    Ok(email)
}

/// Strips formatting from a phone number, keeping a leading `+`.
///
/// ## Rules
/// - 7 to 15 digits after stripping (E.164 upper bound)
pub fn normalize_phone(phone: &str) -> ValidationResult<String> {
    let trimmed = phone.trim();
    let plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(ValidationError::Required {
            field: "phone".to_string(),
        });
    }
    if !(7..=15).contains(&digits.len()) {
        return Err(ValidationError::InvalidFormat {
            field: "phone".to_string(),
            reason: "must contain 7 to 15 digits".to_string(),
        });
    }

    Ok(if plus { format!("+{}", digits) } else { digits })
}

/// Validates a person name fragment (first or last name).
pub fn validate_name(field: &str, name: &str) -> ValidationResult<String> {
    let name = name.trim();

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(name.to_string())
}

// =============================================================================
// Loyalty
// =============================================================================

/// Loyalty balances and counters can never be negative.
pub fn validate_non_negative(field: &str, value: i64) -> ValidationResult<i64> {
    if value < 0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require() {
        assert_eq!(require("customerId", Some(" crm-1 ")).unwrap(), "crm-1");
        assert!(require("customerId", Some("   ")).is_err());
        assert!(require("customerId", None).is_err());
    }

    #[test]
    fn test_email_rules() {
        assert_eq!(normalize_email("A@B.co").unwrap(), "a@b.co");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("a@b@c.com").is_err());
        assert!(normalize_email("a@localhost").is_err());
        assert!(normalize_email("").is_err());
    }

    #[test]
    fn test_phone_rules() {
        assert_eq!(normalize_phone("+1 (555) 010-2030").unwrap(), "+15550102030");
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("--").is_err());
    }

    #[test]
    fn test_name_length() {
        assert_eq!(validate_name("firstName", "  Ada ").unwrap(), "Ada");
        assert!(validate_name("firstName", &"x".repeat(101)).is_err());
    }

    #[test]
    fn test_non_negative() {
        assert_eq!(validate_non_negative("loyaltyPoints", 0).unwrap(), 0);
        assert!(validate_non_negative("loyaltyPoints", -1).is_err());
    }
}
