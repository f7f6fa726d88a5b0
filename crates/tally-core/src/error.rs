//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Rejected state transitions                     │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors                                                       │
//! │  └── DbError          - Local storage failures                         │
//! │                                                                         │
//! │  tally-sync errors                                                     │
//! │  └── SyncError        - What a command or drain reports                │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `CoreError` always means nothing was applied: transitions run against
//! a draft copy of the state, and the draft is discarded on error.

use thiserror::Error;

use crate::types::{OrderStatus, TableStatus};

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations raised by [`crate::state::PosState`] transitions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No active order carries this id.
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// No table carries this id.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// No cart line carries this id.
    #[error("Cart line not found: {0}")]
    CartLineNotFound(String),

    /// Order status can only move forward, and never out of a terminal status.
    ///
    /// ## Allowed Moves
    /// ```text
    /// Open ──► InProgress ──► Completed
    ///   │          │
    ///   └──────────┴──────► Cancelled
    /// ```
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Table status change conflicts with an order still seated there.
    #[error("Table {table_id} is held by open order {order_id}, cannot set {requested}")]
    TableInUse {
        table_id: String,
        order_id: String,
        requested: TableStatus,
    },

    /// Orders and payments need a current session.
    #[error("No session is open on this terminal")]
    NoActiveSession,

    /// A session is already current.
    #[error("Session {0} is already open")]
    SessionAlreadyOpen(String),

    /// Cannot submit or hold an empty cart.
    #[error("Cart is empty")]
    EmptyCart,

    /// Recalling into a non-empty cart would silently drop its lines.
    #[error("Cart already has {lines} line(s); clear it before recalling an order")]
    CartNotEmpty { lines: usize },

    /// Only held orders can be recalled into the cart.
    #[error("Order {0} is not a held order")]
    OrderNotHeld(String),

    /// Held orders never reach the backend, so they cannot be paid.
    #[error("Order {0} is held; recall and submit it first")]
    OrderIsHeld(String),

    /// Cart has exceeded maximum allowed lines.
    #[error("Cart cannot have more than {max} items")]
    CartTooLarge { max: usize },

    /// Line quantity exceeds maximum allowed.
    #[error("Quantity {requested} exceeds maximum allowed ({max})")]
    QuantityTooLarge { requested: i64, max: i64 },

    /// Payment amount is invalid.
    #[error("Invalid payment amount: {reason}")]
    InvalidPaymentAmount { reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_error_message() {
        let err = CoreError::InvalidStatusTransition {
            order_id: "R1".to_string(),
            from: OrderStatus::Completed,
            to: OrderStatus::Open,
        };
        assert_eq!(
            err.to_string(),
            "Order R1 cannot move from completed to open"
        );
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "table_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
