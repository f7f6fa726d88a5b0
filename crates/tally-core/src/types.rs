//! # Domain Types
//!
//! Entities the terminal keeps in its local store.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  ActiveOrder    │   │     Table       │   │    Session      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  id             │   │  id             │       │
//! │  │  items          │──►│  status         │   │  sync_identifier│       │
//! │  │  table_id       │   │  seats, section │   │  is_synced      │       │
//! │  │  status         │   └─────────────────┘   └─────────────────┘       │
//! │  │  payments       │                                                    │
//! │  └─────────────────┘   ┌─────────────────┐   ┌─────────────────┐       │
//! │                        │  OrderStatus    │   │  TableStatus    │       │
//! │                        │  Open           │   │  Available      │       │
//! │                        │  InProgress     │   │  Occupied       │       │
//! │                        │  Completed  ■   │   │  Reserved       │       │
//! │                        │  Cancelled  ■   │   └─────────────────┘       │
//! │                        └─────────────────┘   ■ = terminal              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! Orders and sessions created offline carry a placeholder id (see
//! [`crate::ids`]) until the backend confirms them. Tables, customers and
//! employees always carry backend ids because they come from the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::cart::CartItem;
use crate::ids;

// =============================================================================
// Catalog Snapshots
// =============================================================================

/// Product fields captured at the moment it was added to the cart.
///
/// Later catalog price changes never alter an order that already captured
/// its price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProductSnapshot {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub cost_cents: i64,
}

impl ProductSnapshot {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        price_cents: i64,
        cost_cents: i64,
    ) -> Self {
        ProductSnapshot {
            id: id.into(),
            name: name.into(),
            price_cents,
            cost_cents,
        }
    }
}

/// A modifier applied to a cart line ("extra shot", "no onions").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Modifier {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Employee {
    pub id: String,
    pub name: String,
    pub role: String,
}

// =============================================================================
// Tables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableStatus::Available => write!(f, "available"),
            TableStatus::Occupied => write!(f, "occupied"),
            TableStatus::Reserved => write!(f, "reserved"),
        }
    }
}

/// A dining table.
///
/// ## Invariant
/// A table referenced by a submitted, non-terminal order is never
/// `Available`. See [`crate::state::PosState::set_table_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Table {
    pub id: String,
    pub name: String,
    pub status: TableStatus,
    pub seats: u32,
    pub section: Option<String>,
}

impl Table {
    pub fn new(id: impl Into<String>, name: impl Into<String>, seats: u32) -> Self {
        Table {
            id: id.into(),
            name: name.into(),
            status: TableStatus::Available,
            seats,
            section: None,
        }
    }
}

// =============================================================================
// Order Status
// =============================================================================

/// Lifecycle of an active order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// `Completed` and `Cancelled` admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::Open => 0,
            OrderStatus::InProgress => 1,
            OrderStatus::Completed | OrderStatus::Cancelled => 2,
        }
    }

    /// Returns true if moving from `self` to `next` is allowed.
    ///
    /// Re-applying the current status is allowed (idempotent no-op).
    /// `Cancelled` is reachable from any non-terminal status.
    ///
    /// ```rust
    /// use tally_core::OrderStatus;
    ///
    /// assert!(OrderStatus::Open.can_transition_to(OrderStatus::InProgress));
    /// assert!(OrderStatus::InProgress.can_transition_to(OrderStatus::InProgress));
    /// assert!(!OrderStatus::InProgress.can_transition_to(OrderStatus::Open));
    /// assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Cancelled));
    /// ```
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == OrderStatus::Cancelled || next.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::InProgress => write!(f, "in_progress"),
            OrderStatus::Completed => write!(f, "completed"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mobile,
    GiftCard,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::Cash => write!(f, "cash"),
            PaymentMethod::Card => write!(f, "card"),
            PaymentMethod::Mobile => write!(f, "mobile"),
            PaymentMethod::GiftCard => write!(f, "gift_card"),
        }
    }
}

/// A payment recorded against an order.
///
/// `transaction_ref` is generated locally; `transaction_id` is filled in
/// once the backend confirms the payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OrderPayment {
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub tip_cents: i64,
    pub transaction_ref: String,
    pub transaction_id: Option<String>,
    #[ts(as = "String")]
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// Active Order
// =============================================================================

/// An order the terminal is tracking: submitted (placeholder or backend id)
/// or held locally (`hold-…` id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ActiveOrder {
    pub id: String,
    pub items: Vec<CartItem>,
    pub customer: Option<Customer>,
    pub table_id: Option<String>,
    pub employee: Option<Employee>,
    pub status: OrderStatus,
    #[serde(default)]
    pub payments: Vec<OrderPayment>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl ActiveOrder {
    /// Held orders are parked carts that the backend never sees.
    pub fn is_held(&self) -> bool {
        ids::is_held(&self.id)
    }

    pub fn total_cents(&self) -> i64 {
        self.items.iter().map(CartItem::line_total_cents).sum()
    }

    pub fn paid_cents(&self) -> i64 {
        self.payments.iter().map(|p| p.amount_cents).sum()
    }

    /// True if this order keeps its table out of `Available`.
    pub fn occupies_table(&self, table_id: &str) -> bool {
        !self.is_held()
            && !self.status.is_terminal()
            && self.table_id.as_deref() == Some(table_id)
    }
}

// =============================================================================
// Session
// =============================================================================

/// A cash-drawer session on this terminal.
///
/// Offline-created sessions use the same placeholder for `id` and
/// `sync_identifier`, with `is_synced = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Session {
    pub id: String,
    pub sync_identifier: String,
    pub opening_balance_cents: i64,
    pub terminal_id: String,
    #[ts(as = "String")]
    pub opened_at: DateTime<Utc>,
    pub is_synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use OrderStatus::*;

        assert!(Open.can_transition_to(InProgress));
        assert!(Open.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Open));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        use OrderStatus::*;

        assert!(Open.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&OrderStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TableStatus::Occupied.to_string(), "occupied");
    }
}
