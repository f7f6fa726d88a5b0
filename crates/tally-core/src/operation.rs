//! # Pending Operations
//!
//! Payload snapshots of intents recorded while the backend was unreachable,
//! and the identifier rewriting applied to them during replay.
//!
//! ## Replay Dependencies
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  seq │ operation                          │ references                  │
//! │  ────┼────────────────────────────────────┼──────────────────────────── │
//! │   1  │ StartSession(ref = local-S)        │ produces local-S            │
//! │   2  │ CreateOrder(ref = local-O, local-S)│ needs local-S, produces O   │
//! │   3  │ UpdateTableStatus(T4, occupied)    │ -                           │
//! │   4  │ UpdateOrderStatus(local-O, ...)    │ needs local-O               │
//! │   5  │ ProcessPayment(local-O, local-S)   │ needs local-O, local-S      │
//! │                                                                         │
//! │  Confirming 1 yields IdRemap::Session(local-S → S9): rows 2 and 5      │
//! │  are rewritten before they reach the head of the queue.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads are copied at enqueue time. They never point at live entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cart::CartItem;
use crate::ids;
use crate::types::{OrderStatus, PaymentMethod, TableStatus};
use crate::DEFAULT_TAX_PROFILE;

// =============================================================================
// Payloads
// =============================================================================

/// One order line as the backend receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub stock_item: String,
    pub quantity: i64,
    pub captured_price_cents: i64,
    pub captured_cost_cents: i64,
    pub tax_profile: i64,
    pub notes: Option<String>,
}

impl From<&CartItem> for OrderLine {
    fn from(item: &CartItem) -> Self {
        OrderLine {
            stock_item: item.product.id.clone(),
            quantity: item.quantity,
            captured_price_cents: item.unit_price_cents(),
            captured_cost_cents: item.product.cost_cents,
            tax_profile: DEFAULT_TAX_PROFILE,
            notes: item.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderPayload {
    /// Local order id; doubles as the backend's deduplication reference.
    pub client_reference: String,
    pub session_id: String,
    pub items: Vec<OrderLine>,
    pub customer_id: Option<String>,
    pub table_id: Option<String>,
    pub employee_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOrderStatusPayload {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTableStatusPayload {
    pub table_id: String,
    pub status: TableStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPaymentPayload {
    pub order_id: String,
    pub session_id: String,
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub tip_cents: i64,
    pub transaction_ref: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionPayload {
    /// Local session id the backend result will replace.
    pub client_reference: String,
    pub opening_balance_cents: i64,
    pub terminal_id: String,
    pub idempotency_key: String,
}

// =============================================================================
// Operation
// =============================================================================

/// A queued intent. One variant per remote call, with a fixed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    CreateOrder(CreateOrderPayload),
    UpdateOrderStatus(UpdateOrderStatusPayload),
    UpdateTableStatus(UpdateTableStatusPayload),
    ProcessPayment(ProcessPaymentPayload),
    StartSession(StartSessionPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateOrder,
    UpdateOrderStatus,
    UpdateTableStatus,
    ProcessPayment,
    StartSession,
}

impl OperationKind {
    /// Kinds whose terminal rejection halts the drain instead of being
    /// dropped: everything queued behind them may depend on their result.
    pub fn is_blocking(&self) -> bool {
        matches!(self, OperationKind::CreateOrder | OperationKind::StartSession)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::CreateOrder => write!(f, "create_order"),
            OperationKind::UpdateOrderStatus => write!(f, "update_order_status"),
            OperationKind::UpdateTableStatus => write!(f, "update_table_status"),
            OperationKind::ProcessPayment => write!(f, "process_payment"),
            OperationKind::StartSession => write!(f, "start_session"),
        }
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateOrder(_) => OperationKind::CreateOrder,
            Operation::UpdateOrderStatus(_) => OperationKind::UpdateOrderStatus,
            Operation::UpdateTableStatus(_) => OperationKind::UpdateTableStatus,
            Operation::ProcessPayment(_) => OperationKind::ProcessPayment,
            Operation::StartSession(_) => OperationKind::StartSession,
        }
    }

    /// Placeholder ids this operation needs resolved before it can be sent.
    pub fn placeholder_refs(&self) -> Vec<&str> {
        let refs: Vec<&str> = match self {
            Operation::CreateOrder(p) => vec![p.session_id.as_str()],
            Operation::UpdateOrderStatus(p) => vec![p.order_id.as_str()],
            Operation::UpdateTableStatus(_) => vec![],
            Operation::ProcessPayment(p) => vec![p.order_id.as_str(), p.session_id.as_str()],
            Operation::StartSession(_) => vec![],
        };
        refs.into_iter().filter(|id| ids::is_placeholder(id)).collect()
    }

    /// The placeholder this operation's confirmation will replace, if any.
    pub fn produced_placeholder(&self) -> Option<&str> {
        match self {
            Operation::CreateOrder(p) if ids::is_placeholder(&p.client_reference) => {
                Some(p.client_reference.as_str())
            }
            Operation::StartSession(p) if ids::is_placeholder(&p.client_reference) => {
                Some(p.client_reference.as_str())
            }
            _ => None,
        }
    }

    /// Replaces references to the remapped placeholder.
    ///
    /// The operation's own `client_reference` is left untouched: it is the
    /// deduplication key the backend already saw.
    ///
    /// ## Returns
    /// `true` if any field changed.
    pub fn rewrite(&mut self, remap: &IdRemap) -> bool {
        let mut changed = false;
        let mut swap = |field: &mut String, target: RemapTarget| {
            if remap.target() == target && field.as_str() == remap.placeholder() {
                *field = remap.remote_id().to_string();
                changed = true;
            }
        };

        match self {
            Operation::CreateOrder(p) => swap(&mut p.session_id, RemapTarget::Session),
            Operation::UpdateOrderStatus(p) => swap(&mut p.order_id, RemapTarget::Order),
            Operation::UpdateTableStatus(_) => {}
            Operation::ProcessPayment(p) => {
                swap(&mut p.order_id, RemapTarget::Order);
                swap(&mut p.session_id, RemapTarget::Session);
            }
            Operation::StartSession(_) => {}
        }
        changed
    }

    /// The id this operation acts on, for logs.
    pub fn subject(&self) -> &str {
        match self {
            Operation::CreateOrder(p) => &p.client_reference,
            Operation::UpdateOrderStatus(p) => &p.order_id,
            Operation::UpdateTableStatus(p) => &p.table_id,
            Operation::ProcessPayment(p) => &p.order_id,
            Operation::StartSession(p) => &p.client_reference,
        }
    }
}

// =============================================================================
// Identifier Remapping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemapTarget {
    Order,
    Session,
}

/// A placeholder → backend id substitution produced by a confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum IdRemap {
    Order {
        placeholder: String,
        remote_id: String,
    },
    Session {
        placeholder: String,
        remote_id: String,
        sync_identifier: String,
    },
}

impl IdRemap {
    pub fn placeholder(&self) -> &str {
        match self {
            IdRemap::Order { placeholder, .. } | IdRemap::Session { placeholder, .. } => {
                placeholder
            }
        }
    }

    pub fn remote_id(&self) -> &str {
        match self {
            IdRemap::Order { remote_id, .. } | IdRemap::Session { remote_id, .. } => remote_id,
        }
    }

    fn target(&self) -> RemapTarget {
        match self {
            IdRemap::Order { .. } => RemapTarget::Order,
            IdRemap::Session { .. } => RemapTarget::Session,
        }
    }
}

// =============================================================================
// Queue Records
// =============================================================================

/// An operation waiting in the durable queue.
///
/// ## Invariants
/// - `sequence_id` strictly increases in enqueue order, across restarts.
/// - `attempts` only counts confirmed failed remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub sequence_id: u64,
    pub operation: Operation,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The backend rejected it terminally.
    Rejected,
    /// It referenced a placeholder that can no longer be resolved.
    Quarantined,
    /// An operator dropped it.
    Discarded,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Rejected => write!(f, "rejected"),
            DeadLetterReason::Quarantined => write!(f, "quarantined"),
            DeadLetterReason::Discarded => write!(f, "discarded"),
        }
    }
}

/// An operation removed from the queue without being confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: PendingOperation,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub removed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_update(order_id: &str) -> Operation {
        Operation::UpdateOrderStatus(UpdateOrderStatusPayload {
            order_id: order_id.to_string(),
            status: OrderStatus::InProgress,
        })
    }

    fn payment(order_id: &str, session_id: &str) -> Operation {
        Operation::ProcessPayment(ProcessPaymentPayload {
            order_id: order_id.to_string(),
            session_id: session_id.to_string(),
            method: PaymentMethod::Cash,
            amount_cents: 1200,
            tip_cents: 0,
            transaction_ref: "TXN-1".to_string(),
            idempotency_key: "tok-1".to_string(),
        })
    }

    #[test]
    fn test_order_remap_rewrites_status_update() {
        let mut op = status_update("local-1");
        let remap = IdRemap::Order {
            placeholder: "local-1".to_string(),
            remote_id: "R1".to_string(),
        };

        assert!(op.rewrite(&remap));
        assert_eq!(op, status_update("R1"));
        assert!(op.placeholder_refs().is_empty());
    }

    #[test]
    fn test_session_remap_leaves_order_reference_alone() {
        // Same placeholder string in both slots is contrived, but proves the
        // remap only touches fields of its own entity type.
        let mut op = payment("local-x", "local-x");
        let remap = IdRemap::Session {
            placeholder: "local-x".to_string(),
            remote_id: "S1".to_string(),
            sync_identifier: "sync-1".to_string(),
        };

        assert!(op.rewrite(&remap));
        assert_eq!(op, payment("local-x", "S1"));
    }

    #[test]
    fn test_rewrite_ignores_unrelated_placeholder() {
        let mut op = status_update("local-2");
        let remap = IdRemap::Order {
            placeholder: "local-1".to_string(),
            remote_id: "R1".to_string(),
        };
        assert!(!op.rewrite(&remap));
    }

    #[test]
    fn test_placeholder_refs() {
        assert_eq!(payment("local-o", "S1").placeholder_refs(), vec!["local-o"]);
        assert!(payment("R1", "S1").placeholder_refs().is_empty());
    }

    #[test]
    fn test_blocking_kinds() {
        assert!(OperationKind::CreateOrder.is_blocking());
        assert!(OperationKind::StartSession.is_blocking());
        assert!(!OperationKind::ProcessPayment.is_blocking());
        assert!(!OperationKind::UpdateTableStatus.is_blocking());
    }

    #[test]
    fn test_tagged_wire_shape() {
        let json = serde_json::to_value(status_update("R7")).unwrap();
        assert_eq!(json["kind"], "update_order_status");
        assert_eq!(json["payload"]["order_id"], "R7");
        assert_eq!(json["payload"]["status"], "in_progress");
    }
}
