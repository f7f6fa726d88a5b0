//! # POS State
//!
//! The complete local view the terminal works from, and every transition
//! that may be applied to it.
//!
//! ## Transition Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Draft → Validate → Commit                            │
//! │                                                                         │
//! │   guard = entities.lock()                                              │
//! │   draft = guard.draft()            clone of the committed state        │
//! │   draft.place_order(..)?           pure, may fail with CoreError       │
//! │   queue.enqueue(ops)?              durable intent                      │
//! │   guard.commit(draft)?             durable snapshot, then swap         │
//! │                                                                         │
//! │   Any failure drops the draft: the committed state never sees a        │
//! │   half-applied command.                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is deterministic: ids and timestamps are passed in by the
//! caller so a command can be re-planned against fresh state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::cart::Cart;
use crate::error::{CoreError, CoreResult};
use crate::ids;
use crate::operation::IdRemap;
use crate::types::{
    ActiveOrder, Customer, Employee, OrderPayment, OrderStatus, Session, Table, TableStatus,
};
use crate::validation::{validate_id, validate_payment_amount, validate_tip};

// =============================================================================
// Pos State
// =============================================================================

/// Everything persisted under the entity snapshot key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PosState {
    #[serde(default)]
    pub cart: Cart,
    pub selected_customer: Option<Customer>,
    pub selected_table: Option<String>,
    pub current_employee: Option<Employee>,
    #[serde(default)]
    pub active_orders: Vec<ActiveOrder>,
    #[serde(default)]
    pub tables: Vec<Table>,
    pub current_session: Option<Session>,
    /// User-forced offline mode; survives restarts.
    #[serde(default)]
    pub offline_mode: bool,
}

/// What an order status change did besides updating the order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusChange {
    /// False when the order already had the requested status.
    pub changed: bool,
    /// Table returned to `Available` by this change.
    pub released_table: Option<String>,
    /// The order is held locally; nothing should reach the backend.
    pub held: bool,
}

impl PosState {
    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn order(&self, id: &str) -> Option<&ActiveOrder> {
        self.active_orders.iter().find(|o| o.id == id)
    }

    pub fn table(&self, id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    /// The submitted, non-terminal order seated at this table, if any.
    pub fn occupant_of(&self, table_id: &str) -> Option<&ActiveOrder> {
        self.active_orders
            .iter()
            .find(|o| o.occupies_table(table_id))
    }

    pub fn session(&self) -> CoreResult<&Session> {
        self.current_session.as_ref().ok_or(CoreError::NoActiveSession)
    }

    fn order_mut(&mut self, id: &str) -> CoreResult<&mut ActiveOrder> {
        self.active_orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| CoreError::OrderNotFound(id.to_string()))
    }

    fn table_mut(&mut self, id: &str) -> CoreResult<&mut Table> {
        self.tables
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::TableNotFound(id.to_string()))
    }

    // =========================================================================
    // Selections (local only)
    // =========================================================================

    /// Replaces the table list with a fresh catalog copy, keeping the
    /// local status of tables that are already known.
    pub fn load_tables(&mut self, tables: Vec<Table>) {
        let known = std::mem::take(&mut self.tables);
        self.tables = tables
            .into_iter()
            .map(|mut table| {
                if let Some(existing) = known.iter().find(|t| t.id == table.id) {
                    table.status = existing.status;
                }
                table
            })
            .collect();
    }

    pub fn select_table(&mut self, table_id: Option<String>) -> CoreResult<()> {
        if let Some(id) = table_id.as_deref() {
            validate_id("table_id", id)?;
            if self.table(id).is_none() {
                return Err(CoreError::TableNotFound(id.to_string()));
            }
        }
        self.selected_table = table_id;
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub fn open_session(&mut self, session: Session) -> CoreResult<()> {
        if let Some(current) = &self.current_session {
            return Err(CoreError::SessionAlreadyOpen(current.id.clone()));
        }
        self.current_session = Some(session);
        Ok(())
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Turns the cart into a submitted order.
    ///
    /// ## Effects
    /// - requires a current session and a non-empty cart
    /// - marks the selected table `Occupied`
    /// - clears the cart, customer and table selections
    pub fn place_order(&mut self, order_id: &str, now: DateTime<Utc>) -> CoreResult<ActiveOrder> {
        self.session()?;
        if self.cart.is_empty() {
            return Err(CoreError::EmptyCart);
        }

        if let Some(table_id) = self.selected_table.clone() {
            if let Some(occupant) = self.occupant_of(&table_id) {
                return Err(CoreError::TableInUse {
                    table_id,
                    order_id: occupant.id.clone(),
                    requested: TableStatus::Occupied,
                });
            }
            self.table_mut(&table_id)?.status = TableStatus::Occupied;
        }

        let order = ActiveOrder {
            id: order_id.to_string(),
            items: std::mem::take(&mut self.cart.items),
            customer: self.selected_customer.take(),
            table_id: self.selected_table.take(),
            employee: self.current_employee.clone(),
            status: OrderStatus::Open,
            payments: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.active_orders.push(order.clone());
        Ok(order)
    }

    /// Parks the cart as a held order. Held orders do not claim their table.
    pub fn hold_cart(&mut self, held_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
        if self.cart.is_empty() {
            return Err(CoreError::EmptyCart);
        }

        self.active_orders.push(ActiveOrder {
            id: held_id.to_string(),
            items: std::mem::take(&mut self.cart.items),
            customer: self.selected_customer.take(),
            table_id: self.selected_table.take(),
            employee: self.current_employee.clone(),
            status: OrderStatus::Open,
            payments: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    /// Moves a held order back into the (empty) cart.
    pub fn recall_order(&mut self, order_id: &str) -> CoreResult<()> {
        let order = self
            .order(order_id)
            .ok_or_else(|| CoreError::OrderNotFound(order_id.to_string()))?;
        if !order.is_held() {
            return Err(CoreError::OrderNotHeld(order_id.to_string()));
        }
        if !self.cart.is_empty() {
            return Err(CoreError::CartNotEmpty {
                lines: self.cart.len(),
            });
        }

        let position = self
            .active_orders
            .iter()
            .position(|o| o.id == order_id)
            .ok_or_else(|| CoreError::OrderNotFound(order_id.to_string()))?;
        let order = self.active_orders.remove(position);

        self.cart.items = order.items;
        self.selected_customer = order.customer;
        self.selected_table = order.table_id;
        Ok(())
    }

    /// Applies an order status change.
    ///
    /// ## Table Release
    /// A submitted order entering a terminal status returns its table to
    /// `Available`. Terminal statuses admit no further transition and a
    /// same-status update is a no-op, so the release happens exactly once.
    ///
    /// Held orders reaching a terminal status are dropped immediately.
    pub fn set_order_status(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<StatusChange> {
        let order = self.order_mut(order_id)?;
        if !order.status.can_transition_to(status) {
            return Err(CoreError::InvalidStatusTransition {
                order_id: order_id.to_string(),
                from: order.status,
                to: status,
            });
        }

        let held = order.is_held();
        if order.status == status {
            return Ok(StatusChange {
                changed: false,
                released_table: None,
                held,
            });
        }

        order.status = status;
        order.updated_at = now;
        let table_id = order.table_id.clone();

        if held {
            if status.is_terminal() {
                self.active_orders.retain(|o| o.id != order_id);
            }
            return Ok(StatusChange {
                changed: true,
                released_table: None,
                held,
            });
        }

        let mut released_table = None;
        if status.is_terminal() {
            if let Some(table_id) = table_id {
                if let Ok(table) = self.table_mut(&table_id) {
                    if table.status != TableStatus::Available {
                        table.status = TableStatus::Available;
                        released_table = Some(table_id);
                    }
                }
            }
        }

        Ok(StatusChange {
            changed: true,
            released_table,
            held,
        })
    }

    /// Drops an order whose terminal status the backend acknowledged.
    pub fn confirm_terminal(&mut self, order_id: &str) -> bool {
        let before = self.active_orders.len();
        self.active_orders
            .retain(|o| !(o.id == order_id && o.status.is_terminal()));
        self.active_orders.len() != before
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Sets a table's status.
    ///
    /// ## Returns
    /// `false` if the table already had that status.
    ///
    /// ## Errors
    /// `TableInUse` when freeing a table an open order is seated at.
    pub fn set_table_status(&mut self, table_id: &str, status: TableStatus) -> CoreResult<bool> {
        if status == TableStatus::Available {
            if let Some(occupant) = self.occupant_of(table_id) {
                return Err(CoreError::TableInUse {
                    table_id: table_id.to_string(),
                    order_id: occupant.id.clone(),
                    requested: status,
                });
            }
        }

        let table = self.table_mut(table_id)?;
        if table.status == status {
            return Ok(false);
        }
        table.status = status;
        Ok(true)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    pub fn record_payment(&mut self, order_id: &str, payment: OrderPayment) -> CoreResult<()> {
        self.session()?;
        validate_payment_amount(payment.amount_cents)?;
        validate_tip(payment.tip_cents)?;

        let order = self.order_mut(order_id)?;
        if order.is_held() {
            return Err(CoreError::OrderIsHeld(order_id.to_string()));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(CoreError::InvalidPaymentAmount {
                reason: format!("order {} is cancelled", order_id),
            });
        }

        order.updated_at = payment.recorded_at;
        order.payments.push(payment);
        Ok(())
    }

    /// Stores the backend transaction id on a recorded payment.
    pub fn confirm_payment(
        &mut self,
        order_id: &str,
        transaction_ref: &str,
        transaction_id: &str,
    ) -> bool {
        let Ok(order) = self.order_mut(order_id) else {
            return false;
        };
        match order
            .payments
            .iter_mut()
            .find(|p| p.transaction_ref == transaction_ref)
        {
            Some(payment) => {
                payment.transaction_id = Some(transaction_id.to_string());
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Replaces a confirmed placeholder with its backend identity.
    ///
    /// ## Returns
    /// `true` if an entity carried the placeholder.
    pub fn apply_remap(&mut self, remap: &IdRemap) -> bool {
        match remap {
            IdRemap::Order {
                placeholder,
                remote_id,
            } => match self.active_orders.iter_mut().find(|o| &o.id == placeholder) {
                Some(order) => {
                    order.id = remote_id.clone();
                    true
                }
                None => false,
            },
            IdRemap::Session {
                placeholder,
                remote_id,
                sync_identifier,
            } => match self.current_session.as_mut() {
                Some(session) if &session.id == placeholder => {
                    session.id = remote_id.clone();
                    session.sync_identifier = sync_identifier.clone();
                    session.is_synced = true;
                    true
                }
                _ => false,
            },
        }
    }

    /// Drops a local-only order or session whose creation the backend will
    /// never confirm.
    ///
    /// ## Returns
    /// The table released by dropping the order, if any.
    pub fn drop_unsynced(&mut self, placeholder: &str) -> Option<String> {
        if !ids::is_placeholder(placeholder) {
            return None;
        }

        if self
            .current_session
            .as_ref()
            .is_some_and(|s| s.id == placeholder)
        {
            self.current_session = None;
            return None;
        }

        let position = self.active_orders.iter().position(|o| o.id == placeholder)?;
        let order = self.active_orders.remove(position);
        let table_id = order.table_id?;
        if self.occupant_of(&table_id).is_some() {
            return None;
        }
        let table = self.table_mut(&table_id).ok()?;
        if table.status == TableStatus::Available {
            return None;
        }
        table.status = TableStatus::Available;
        Some(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentMethod, ProductSnapshot};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            sync_identifier: id.to_string(),
            opening_balance_cents: 10_000,
            terminal_id: "till-1".to_string(),
            opened_at: now(),
            is_synced: false,
        }
    }

    fn ready_state() -> PosState {
        let mut state = PosState::default();
        state.load_tables(vec![Table::new("T4", "Table 4", 4)]);
        state.open_session(session("local-s")).unwrap();
        state
            .cart
            .add(ProductSnapshot::new("p-1", "Burger", 1200, 400), 1, vec![], None)
            .unwrap();
        state
    }

    fn payment(amount_cents: i64) -> OrderPayment {
        OrderPayment {
            method: PaymentMethod::Card,
            amount_cents,
            tip_cents: 0,
            transaction_ref: "TXN-1".to_string(),
            transaction_id: None,
            recorded_at: now(),
        }
    }

    #[test]
    fn test_place_order_occupies_table_and_clears_cart() {
        let mut state = ready_state();
        state.select_table(Some("T4".into())).unwrap();

        let order = state.place_order("local-o", now()).unwrap();

        assert_eq!(order.table_id.as_deref(), Some("T4"));
        assert_eq!(state.table("T4").unwrap().status, TableStatus::Occupied);
        assert!(state.cart.is_empty());
        assert!(state.selected_table.is_none());
    }

    #[test]
    fn test_place_order_requires_session() {
        let mut state = ready_state();
        state.current_session = None;

        assert!(matches!(
            state.place_order("local-o", now()),
            Err(CoreError::NoActiveSession)
        ));
        assert_eq!(state.cart.len(), 1);
    }

    #[test]
    fn test_terminal_status_releases_table_once() {
        let mut state = ready_state();
        state.select_table(Some("T4".into())).unwrap();
        state.place_order("local-o", now()).unwrap();

        let first = state
            .set_order_status("local-o", OrderStatus::Completed, now())
            .unwrap();
        assert_eq!(first.released_table.as_deref(), Some("T4"));

        let again = state
            .set_order_status("local-o", OrderStatus::Completed, now())
            .unwrap();
        assert!(!again.changed);
        assert!(again.released_table.is_none());
        assert_eq!(state.table("T4").unwrap().status, TableStatus::Available);
    }

    #[test]
    fn test_status_cannot_move_backwards() {
        let mut state = ready_state();
        state.place_order("local-o", now()).unwrap();
        state
            .set_order_status("local-o", OrderStatus::InProgress, now())
            .unwrap();

        let err = state
            .set_order_status("local-o", OrderStatus::Open, now())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStatusTransition { .. }));
    }

    #[test]
    fn test_cannot_free_table_under_open_order() {
        let mut state = ready_state();
        state.select_table(Some("T4".into())).unwrap();
        state.place_order("local-o", now()).unwrap();

        let err = state
            .set_table_status("T4", TableStatus::Available)
            .unwrap_err();
        assert!(matches!(err, CoreError::TableInUse { .. }));
    }

    #[test]
    fn test_confirm_terminal_removes_only_terminal_orders() {
        let mut state = ready_state();
        state.place_order("R1", now()).unwrap();

        assert!(!state.confirm_terminal("R1"));
        state
            .set_order_status("R1", OrderStatus::Cancelled, now())
            .unwrap();
        assert!(state.confirm_terminal("R1"));
        assert!(state.active_orders.is_empty());
    }

    #[test]
    fn test_remap_order_and_session() {
        let mut state = ready_state();
        state.place_order("local-o", now()).unwrap();

        assert!(state.apply_remap(&IdRemap::Order {
            placeholder: "local-o".into(),
            remote_id: "R1".into(),
        }));
        assert!(state.order("R1").is_some());
        assert!(state.order("local-o").is_none());

        assert!(state.apply_remap(&IdRemap::Session {
            placeholder: "local-s".into(),
            remote_id: "S1".into(),
            sync_identifier: "sync-S1".into(),
        }));
        let session = state.current_session.as_ref().unwrap();
        assert_eq!(session.id, "S1");
        assert_eq!(session.sync_identifier, "sync-S1");
        assert!(session.is_synced);
    }

    #[test]
    fn test_hold_and_recall_round_trip() {
        let mut state = ready_state();
        state.select_table(Some("T4".into())).unwrap();
        state.hold_cart("hold-1", now()).unwrap();

        assert!(state.cart.is_empty());
        // Held orders never claim their table.
        assert_eq!(state.table("T4").unwrap().status, TableStatus::Available);

        state.recall_order("hold-1").unwrap();
        assert_eq!(state.cart.len(), 1);
        assert_eq!(state.selected_table.as_deref(), Some("T4"));
        assert!(state.active_orders.is_empty());
    }

    #[test]
    fn test_recall_rejects_submitted_order() {
        let mut state = ready_state();
        state.place_order("R1", now()).unwrap();

        assert!(matches!(
            state.recall_order("R1"),
            Err(CoreError::OrderNotHeld(_))
        ));
    }

    #[test]
    fn test_payment_rules() {
        let mut state = ready_state();
        state.place_order("R1", now()).unwrap();

        assert!(state.record_payment("R1", payment(0)).is_err());
        state.record_payment("R1", payment(1200)).unwrap();
        assert!(state.confirm_payment("R1", "TXN-1", "T-99"));
        assert_eq!(
            state.order("R1").unwrap().payments[0].transaction_id.as_deref(),
            Some("T-99")
        );
    }

    #[test]
    fn test_split_payments_in_one_millisecond_keep_their_receipts() {
        let mut state = ready_state();
        state.place_order("R1", now()).unwrap();

        let at = now();
        let first_ref = ids::client_transaction_ref(at);
        let second_ref = ids::client_transaction_ref(at);
        for transaction_ref in [&first_ref, &second_ref] {
            state
                .record_payment(
                    "R1",
                    OrderPayment {
                        transaction_ref: transaction_ref.clone(),
                        ..payment(600)
                    },
                )
                .unwrap();
        }

        assert!(state.confirm_payment("R1", &first_ref, "T1"));
        assert!(state.confirm_payment("R1", &second_ref, "T2"));

        let receipts: Vec<_> = state
            .order("R1")
            .unwrap()
            .payments
            .iter()
            .map(|p| p.transaction_id.as_deref())
            .collect();
        assert_eq!(receipts, vec![Some("T1"), Some("T2")]);
    }

    #[test]
    fn test_drop_unsynced_releases_table() {
        let mut state = ready_state();
        state.select_table(Some("T4".into())).unwrap();
        state.place_order("local-o", now()).unwrap();

        assert_eq!(state.drop_unsynced("local-o").as_deref(), Some("T4"));
        assert!(state.active_orders.is_empty());
        assert_eq!(state.table("T4").unwrap().status, TableStatus::Available);
    }
}
