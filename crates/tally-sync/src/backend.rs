//! # Backend Seam
//!
//! The backend of record as the sync engine sees it: one async call per
//! operation kind, each returning a confirmation or a classified failure.
//!
//! ## Call Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Operation            │ Backend call          │ Confirmation            │
//! │  ─────────────────────┼───────────────────────┼──────────────────────── │
//! │  CreateOrder          │ create_order          │ RemoteOrder{id}   remap │
//! │  UpdateOrderStatus    │ update_order_status   │ ()                      │
//! │  UpdateTableStatus    │ update_table_status   │ ()                      │
//! │  ProcessPayment       │ process_payment       │ PaymentReceipt          │
//! │  StartSession         │ start_session         │ RemoteSession     remap │
//! │                                                                         │
//! │  Failure classes:                                                      │
//! │  Timeout, Unavailable  → retryable (operation stays at the head)       │
//! │  Rejected, Conflict    → terminal (dead letter, or blocks the drain)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use tally_core::operation::{
    CreateOrderPayload, ProcessPaymentPayload, StartSessionPayload, UpdateOrderStatusPayload,
    UpdateTableStatusPayload,
};
use tally_core::{IdRemap, Operation, PosState};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend call timed out")]
    Timeout,

    /// Transport failure or a 5xx-equivalent response.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Validation failure the backend will never accept.
    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Timeout | BackendError::Unavailable(_))
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub success: bool,
    pub transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    pub sync_identifier: String,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Remote calls. Implementations must deduplicate `create_order` by
/// `client_reference` and `process_payment`/`start_session` by
/// `idempotency_key`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_order(&self, payload: &CreateOrderPayload) -> Result<RemoteOrder, BackendError>;

    async fn update_order_status(
        &self,
        payload: &UpdateOrderStatusPayload,
    ) -> Result<(), BackendError>;

    async fn update_table_status(
        &self,
        payload: &UpdateTableStatusPayload,
    ) -> Result<(), BackendError>;

    async fn process_payment(
        &self,
        payload: &ProcessPaymentPayload,
    ) -> Result<PaymentReceipt, BackendError>;

    async fn start_session(&self, payload: &StartSessionPayload)
        -> Result<RemoteSession, BackendError>;
}

// =============================================================================
// Dispatch
// =============================================================================

/// A successful remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    OrderCreated(RemoteOrder),
    OrderStatusUpdated,
    TableStatusUpdated,
    PaymentProcessed(PaymentReceipt),
    SessionStarted(RemoteSession),
}

/// Performs the single remote call for `operation`.
///
/// A declined payment (`success = false`) is a terminal rejection.
pub async fn dispatch(
    backend: &dyn Backend,
    operation: &Operation,
) -> Result<Confirmation, BackendError> {
    debug!(kind = %operation.kind(), subject = operation.subject(), "Dispatching");

    match operation {
        Operation::CreateOrder(p) => backend.create_order(p).await.map(Confirmation::OrderCreated),
        Operation::UpdateOrderStatus(p) => backend
            .update_order_status(p)
            .await
            .map(|()| Confirmation::OrderStatusUpdated),
        Operation::UpdateTableStatus(p) => backend
            .update_table_status(p)
            .await
            .map(|()| Confirmation::TableStatusUpdated),
        Operation::ProcessPayment(p) => {
            let receipt = backend.process_payment(p).await?;
            if !receipt.success {
                return Err(BackendError::Rejected(format!(
                    "payment {} declined",
                    p.transaction_ref
                )));
            }
            Ok(Confirmation::PaymentProcessed(receipt))
        }
        Operation::StartSession(p) => {
            backend.start_session(p).await.map(Confirmation::SessionStarted)
        }
    }
}

impl Confirmation {
    /// The placeholder substitution this confirmation implies, if the
    /// operation was created against a placeholder.
    pub fn remap_for(&self, operation: &Operation) -> Option<IdRemap> {
        let placeholder = operation.produced_placeholder()?.to_string();
        match self {
            Confirmation::OrderCreated(order) => Some(IdRemap::Order {
                placeholder,
                remote_id: order.id.clone(),
            }),
            Confirmation::SessionStarted(session) => Some(IdRemap::Session {
                placeholder,
                remote_id: session.id.clone(),
                sync_identifier: session.sync_identifier.clone(),
            }),
            _ => None,
        }
    }
}

/// Folds a confirmation into local state.
///
/// Idempotent: reconciling the same confirmation twice leaves the state as
/// after the first time.
pub fn reconcile(state: &mut PosState, operation: &Operation, confirmation: &Confirmation) {
    if let Some(remap) = confirmation.remap_for(operation) {
        if !state.apply_remap(&remap) {
            debug!(
                placeholder = remap.placeholder(),
                remote_id = remap.remote_id(),
                "No local entity carried the placeholder"
            );
        }
        return;
    }

    match (operation, confirmation) {
        (Operation::UpdateOrderStatus(p), Confirmation::OrderStatusUpdated)
            if p.status.is_terminal() =>
        {
            state.confirm_terminal(&p.order_id);
        }
        (Operation::ProcessPayment(p), Confirmation::PaymentProcessed(receipt)) => {
            state.confirm_payment(&p.order_id, &p.transaction_ref, &receipt.transaction_id);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::types::{OrderStatus, ProductSnapshot, Session};

    fn create(reference: &str) -> Operation {
        Operation::CreateOrder(CreateOrderPayload {
            client_reference: reference.to_string(),
            session_id: "S1".to_string(),
            items: vec![],
            customer_id: None,
            table_id: None,
            employee_id: None,
        })
    }

    fn state_with_order(order_id: &str) -> PosState {
        let mut state = PosState::default();
        state
            .open_session(Session {
                id: "S1".into(),
                sync_identifier: "sync-S1".into(),
                opening_balance_cents: 0,
                terminal_id: "till-1".into(),
                opened_at: chrono::Utc::now(),
                is_synced: true,
            })
            .unwrap();
        state
            .cart
            .add(ProductSnapshot::new("p-1", "Tea", 300, 50), 1, vec![], None)
            .unwrap();
        state.place_order(order_id, chrono::Utc::now()).unwrap();
        state
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BackendError::Timeout.is_retryable());
        assert!(BackendError::Unavailable("502".into()).is_retryable());
        assert!(!BackendError::Rejected("invalid".into()).is_retryable());
        assert!(!BackendError::Conflict("stale".into()).is_retryable());
    }

    #[test]
    fn test_remap_only_for_placeholder_producers() {
        let confirmation = Confirmation::OrderCreated(RemoteOrder { id: "R1".into() });

        assert_eq!(
            confirmation.remap_for(&create("local-1")),
            Some(IdRemap::Order {
                placeholder: "local-1".into(),
                remote_id: "R1".into(),
            })
        );
        assert_eq!(confirmation.remap_for(&create("R0")), None);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut state = state_with_order("local-1");
        let op = create("local-1");
        let confirmation = Confirmation::OrderCreated(RemoteOrder { id: "R1".into() });

        reconcile(&mut state, &op, &confirmation);
        let once = state.clone();
        reconcile(&mut state, &op, &confirmation);

        assert_eq!(state, once);
        assert!(state.order("R1").is_some());
    }

    #[test]
    fn test_terminal_status_confirmation_removes_order() {
        let mut state = state_with_order("R1");
        state
            .set_order_status("R1", OrderStatus::Completed, chrono::Utc::now())
            .unwrap();

        let op = Operation::UpdateOrderStatus(UpdateOrderStatusPayload {
            order_id: "R1".into(),
            status: OrderStatus::Completed,
        });
        reconcile(&mut state, &op, &Confirmation::OrderStatusUpdated);

        assert!(state.order("R1").is_none());
    }
}
