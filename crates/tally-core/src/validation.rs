//! # Validation Module
//!
//! Input checks run before any state transition.
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_quantity, validate_payment_amount};
//!
//! assert!(validate_quantity(5).is_ok());
//! assert!(validate_payment_amount(0).is_err());
//! ```

use crate::error::ValidationError;
use crate::MAX_ITEM_QUANTITY;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates an id supplied by a caller (table, order, cart line).
pub fn validate_id(field: &str, id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a quantity for a new cart line.
///
/// Quantity updates handle `<= 0` as removal before reaching this check.
pub fn validate_quantity(quantity: i64) -> ValidationResult<()> {
    if !(1..=MAX_ITEM_QUANTITY).contains(&quantity) {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }
    Ok(())
}

pub fn validate_payment_amount(amount_cents: i64) -> ValidationResult<()> {
    if amount_cents <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "amount".to_string(),
        });
    }
    Ok(())
}

pub fn validate_tip(tip_cents: i64) -> ValidationResult<()> {
    if tip_cents < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "tip".to_string(),
        });
    }
    Ok(())
}

pub fn validate_opening_balance(balance_cents: i64) -> ValidationResult<()> {
    if balance_cents < 0 {
        return Err(ValidationError::MustNotBeNegative {
            field: "opening_balance".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_quantity_bounds() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_ITEM_QUANTITY).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(MAX_ITEM_QUANTITY + 1).is_err());
    }

    #[test]
    fn test_validate_money() {
        assert!(validate_payment_amount(1).is_ok());
        assert!(validate_payment_amount(-5).is_err());
        assert!(validate_tip(0).is_ok());
        assert!(validate_tip(-1).is_err());
        assert!(validate_opening_balance(0).is_ok());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("table_id", "T1").is_ok());
        assert!(validate_id("table_id", "  ").is_err());
    }
}
