//! # Money Module
//!
//! Provides the `Money` type for handling monetary values on the sync wire.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  Sending amounts as JSON floats:                                        │
//! │    10.1 + 0.2 = 10.299999999999999  ❌ drift on the CRM side            │
//! │                                                                         │
//! │  OUR SOLUTION: Integer cents locally, decimal strings on the wire       │
//! │    Local:  1299 (i64 cents)                                            │
//! │    Wire:   "12.99"  (exactly two fraction digits, never rounded)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::money::Money;
//!
//! let total = Money::from_cents(1299);
//! assert_eq!(total.to_decimal_string(), "12.99");
//!
//! let json = serde_json::to_string(&total).unwrap();
//! assert_eq!(json, "\"12.99\"");
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use crate::error::ValidationError;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (cents).
///
/// Serializes as a fixed-point decimal string (`"12.50"`), which is the form
/// the CRM accepts for every financial field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::money::Money;
    ///
    /// let price = Money::from_cents(1099); // Represents 10.99
    /// assert_eq!(price.cents(), 1099);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is negative (refunds, reversals).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Renders the amount as a decimal string with exactly two fraction digits.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::money::Money;
    ///
    /// assert_eq!(Money::from_cents(5).to_decimal_string(), "0.05");
    /// assert_eq!(Money::from_cents(-550).to_decimal_string(), "-5.50");
    /// ```
    pub fn to_decimal_string(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }

    /// Parses a decimal string (`"12.5"`, `"12.50"`, `"-3"`) into cents.
    ///
    /// More than two fraction digits is rejected rather than rounded.
    pub fn parse_decimal(input: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "amount".to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("expected digits before the decimal point"));
        }
        if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("at most two fraction digits are allowed"));
        }

        let whole: i64 = whole
            .parse()
            .map_err(|_| invalid("amount is out of range"))?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().unwrap_or(0) * 10,
            _ => fraction.parse::<i64>().unwrap_or(0),
        };

        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(fraction))
            .ok_or_else(|| invalid("amount is out of range"))?;

        Ok(Money(if negative { -cents } else { cents }))
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal_string())
    }
}

impl Add for Money {
    type Output = Money;

    #[inline]
    fn add(self, other: Money) -> Money {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Money) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Money;

    #[inline]
    fn sub(self, other: Money) -> Money {
        Money(self.0 - other.0)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Money::parse_decimal(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_rendering() {
        assert_eq!(Money::from_cents(0).to_decimal_string(), "0.00");
        assert_eq!(Money::from_cents(1099).to_decimal_string(), "10.99");
        assert_eq!(Money::from_cents(100_000).to_decimal_string(), "1000.00");
        assert_eq!(Money::from_cents(-1).to_decimal_string(), "-0.01");
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(Money::parse_decimal("12.5").unwrap().cents(), 1250);
        assert_eq!(Money::parse_decimal("12.50").unwrap().cents(), 1250);
        assert_eq!(Money::parse_decimal("7").unwrap().cents(), 700);
        assert_eq!(Money::parse_decimal("-0.05").unwrap().cents(), -5);
    }

    #[test]
    fn test_parse_decimal_rejects_extra_precision() {
        assert!(Money::parse_decimal("1.999").is_err());
        assert!(Money::parse_decimal("abc").is_err());
        assert!(Money::parse_decimal(".50").is_err());
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_value(Money::from_cents(2500)).unwrap();
        assert_eq!(json, serde_json::json!("25.00"));

        let back: Money = serde_json::from_value(json).unwrap();
        assert_eq!(back.cents(), 2500);
    }

    #[test]
    fn test_arithmetic() {
        let mut total = Money::from_cents(1000) + Money::from_cents(250);
        total += Money::from_cents(5);
        assert_eq!(total.cents(), 1255);
        assert_eq!((total - Money::from_cents(255)).cents(), 1000);
        assert!(Money::zero().is_zero());
        assert!(Money::from_cents(-1).is_negative());
    }
}
