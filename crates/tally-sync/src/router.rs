//! # Command Router
//!
//! Entry point for every terminal command. Decides per command whether it
//! stays local, goes straight to the backend, or is queued for replay.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  command ──► command_lock ──► entity lock ──► build(draft)              │
//! │                                                  │                      │
//! │                       no operations ─────────────┼──► commit (local)    │
//! │                                                  │                      │
//! │    Direct mode, online, queue empty,             │                      │
//! │    no placeholder references? ── no ─────────────┼──► enqueue + commit  │
//! │              │                                   │    kick the engine   │
//! │             yes                                                         │
//! │              ▼                                                          │
//! │    release entity lock, call backend (command_timeout)                  │
//! │      rejected first call ──► error, nothing applied                     │
//! │      timeout / retryable ──► rest becomes queued                        │
//! │      rejected follow-up ───► dead letter + attention                    │
//! │              ▼                                                          │
//! │    re-lock, build again, reconcile confirmations, commit                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ids, tokens and timestamps are minted once per command, before the build
//! closure, so rebuilding after the remote calls yields the same payloads.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use tally_core::operation::{
    CreateOrderPayload, OrderLine, ProcessPaymentPayload, StartSessionPayload,
    UpdateOrderStatusPayload, UpdateTableStatusPayload,
};
use tally_core::validation::validate_opening_balance;
use tally_core::{
    ids, CoreResult, Customer, Employee, IdRemap, Modifier, Operation, OrderPayment, OrderStatus,
    PaymentMethod, PosState, ProductSnapshot, Session, Table, TableStatus,
};
use tally_db::{EntityGuard, EntityStore, PendingQueue};

use crate::backend::{dispatch, reconcile, Backend, BackendError, Confirmation};
use crate::config::{RoutingMode, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::engine::SyncEngine;
use crate::error::SyncResult;

// =============================================================================
// Outcomes
// =============================================================================

/// Where a command's effects ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Local state changed; nothing for the backend.
    Applied,
    /// The backend confirmed every operation directly.
    Confirmed,
    /// Some or all operations were queued for replay.
    Queued { sequence_ids: Vec<u64> },
    /// The command was valid but changed nothing.
    Unchanged,
    /// The backend confirmed the first operation but rejected a follow-up.
    /// The rejected ones are in the dead-letter log under `rejected`; any
    /// not yet sent were queued under `queued`.
    PartiallyRejected { rejected: Vec<u64>, queued: Vec<u64> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedOrder {
    /// Backend id if confirmed directly, otherwise the placeholder.
    pub order_id: String,
    pub outcome: CommandOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPayment {
    pub transaction_ref: String,
    /// Present once the backend confirmed the payment.
    pub transaction_id: Option<String>,
    pub outcome: CommandOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedSession {
    pub session_id: String,
    pub outcome: CommandOutcome,
}

struct Routed {
    outcome: CommandOutcome,
    remaps: Vec<IdRemap>,
    confirmations: Vec<Confirmation>,
}

impl Routed {
    fn local(outcome: CommandOutcome) -> Self {
        Routed {
            outcome,
            remaps: Vec::new(),
            confirmations: Vec::new(),
        }
    }

    fn resolve(&self, placeholder: &str) -> String {
        self.remaps
            .iter()
            .find(|remap| remap.placeholder() == placeholder)
            .map(|remap| remap.remote_id().to_string())
            .unwrap_or_else(|| placeholder.to_string())
    }
}

// =============================================================================
// Command Router
// =============================================================================

pub struct CommandRouter {
    entities: Arc<EntityStore>,
    queue: Arc<PendingQueue>,
    backend: Arc<dyn Backend>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    mode: RoutingMode,
    command_timeout: Duration,
    terminal_id: String,
    /// Serializes mutating commands.
    command_lock: Mutex<()>,
}

impl CommandRouter {
    pub fn new(
        entities: Arc<EntityStore>,
        queue: Arc<PendingQueue>,
        backend: Arc<dyn Backend>,
        monitor: Arc<ConnectivityMonitor>,
        engine: Arc<SyncEngine>,
        config: &SyncConfig,
    ) -> Self {
        CommandRouter {
            entities,
            queue,
            backend,
            monitor,
            engine,
            mode: config.routing_mode(),
            command_timeout: config.command_timeout(),
            terminal_id: config.terminal_id().to_string(),
            command_lock: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> PosState {
        self.entities.snapshot().await
    }

    // =========================================================================
    // Cart (local only)
    // =========================================================================

    /// ## Returns
    /// The cart line the quantity landed on.
    pub async fn add_to_cart(
        &self,
        product: ProductSnapshot,
        quantity: i64,
        modifiers: Vec<Modifier>,
        notes: Option<String>,
    ) -> SyncResult<String> {
        self.apply_local(move |state| state.cart.add(product, quantity, modifiers, notes))
            .await
    }

    /// A quantity of zero or less removes the line.
    pub async fn update_quantity(&self, line_id: &str, quantity: i64) -> SyncResult<()> {
        self.apply_local(|state| state.cart.update_quantity(line_id, quantity))
            .await
    }

    pub async fn update_modifiers(&self, line_id: &str, modifiers: Vec<Modifier>) -> SyncResult<()> {
        self.apply_local(move |state| state.cart.update_modifiers(line_id, modifiers))
            .await
    }

    pub async fn update_notes(&self, line_id: &str, notes: Option<String>) -> SyncResult<()> {
        self.apply_local(move |state| state.cart.update_notes(line_id, notes))
            .await
    }

    pub async fn remove_from_cart(&self, line_id: &str) -> SyncResult<()> {
        self.apply_local(|state| state.cart.remove(line_id)).await
    }

    pub async fn clear_cart(&self) -> SyncResult<()> {
        self.apply_local(|state| {
            state.cart.clear();
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Selections (local only)
    // =========================================================================

    pub async fn set_customer(&self, customer: Option<Customer>) -> SyncResult<()> {
        self.apply_local(move |state| {
            state.selected_customer = customer;
            Ok(())
        })
        .await
    }

    pub async fn set_table(&self, table_id: Option<String>) -> SyncResult<()> {
        self.apply_local(move |state| state.select_table(table_id))
            .await
    }

    pub async fn set_employee(&self, employee: Option<Employee>) -> SyncResult<()> {
        self.apply_local(move |state| {
            state.current_employee = employee;
            Ok(())
        })
        .await
    }

    /// Replaces the table list from the catalog, keeping known statuses.
    pub async fn load_tables(&self, tables: Vec<Table>) -> SyncResult<()> {
        self.apply_local(move |state| {
            state.load_tables(tables);
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Held Orders (local only)
    // =========================================================================

    /// Parks the cart. Returns the held order id.
    pub async fn hold_order(&self) -> SyncResult<String> {
        let held_id = ids::new_held_id();
        let now = Utc::now();
        self.apply_local(|state| state.hold_cart(&held_id, now))
            .await?;
        info!(order_id = %held_id, "Cart held");
        Ok(held_id)
    }

    /// Moves a held order back into the empty cart.
    pub async fn recall_order(&self, order_id: &str) -> SyncResult<()> {
        self.apply_local(|state| state.recall_order(order_id))
            .await
    }

    // =========================================================================
    // Routed Commands
    // =========================================================================

    /// Submits the cart as an order.
    ///
    /// ## Effects
    /// - requires a current session and a non-empty cart; clears the cart
    /// - a selected table becomes `Occupied`, locally and remotely
    pub async fn create_order(&self) -> SyncResult<PlacedOrder> {
        let placeholder = ids::new_placeholder();
        let now = Utc::now();

        let routed = self
            .route(|state| {
                let order = state.place_order(&placeholder, now)?;
                let session_id = state.session()?.id.clone();

                let mut operations = vec![Operation::CreateOrder(CreateOrderPayload {
                    client_reference: placeholder.clone(),
                    session_id,
                    items: order.items.iter().map(OrderLine::from).collect(),
                    customer_id: order.customer.as_ref().map(|c| c.id.clone()),
                    table_id: order.table_id.clone(),
                    employee_id: order.employee.as_ref().map(|e| e.id.clone()),
                })];
                if let Some(table_id) = order.table_id {
                    operations.push(Operation::UpdateTableStatus(UpdateTableStatusPayload {
                        table_id,
                        status: TableStatus::Occupied,
                    }));
                }
                Ok(operations)
            })
            .await?;

        let order_id = routed.resolve(&placeholder);
        info!(%order_id, outcome = ?routed.outcome, "Order created");
        Ok(PlacedOrder {
            order_id,
            outcome: routed.outcome,
        })
    }

    /// Moves an order to `status`. A terminal status releases its table.
    /// Held orders change locally only.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> SyncResult<CommandOutcome> {
        let now = Utc::now();
        let routed = self
            .route(|state| {
                let change = state.set_order_status(order_id, status, now)?;
                let mut operations = Vec::new();
                if change.changed && !change.held {
                    operations.push(Operation::UpdateOrderStatus(UpdateOrderStatusPayload {
                        order_id: order_id.to_string(),
                        status,
                    }));
                    if let Some(table_id) = change.released_table {
                        operations.push(Operation::UpdateTableStatus(UpdateTableStatusPayload {
                            table_id,
                            status: TableStatus::Available,
                        }));
                    }
                }
                Ok(operations)
            })
            .await?;
        Ok(routed.outcome)
    }

    pub async fn update_table_status(
        &self,
        table_id: &str,
        status: TableStatus,
    ) -> SyncResult<CommandOutcome> {
        let routed = self
            .route(|state| {
                let operations = if state.set_table_status(table_id, status)? {
                    vec![Operation::UpdateTableStatus(UpdateTableStatusPayload {
                        table_id: table_id.to_string(),
                        status,
                    })]
                } else {
                    Vec::new()
                };
                Ok(operations)
            })
            .await?;
        Ok(routed.outcome)
    }

    /// Records a payment against a submitted order.
    ///
    /// The idempotency token is minted here and travels unchanged through
    /// every retry.
    pub async fn process_payment(
        &self,
        order_id: &str,
        method: PaymentMethod,
        amount_cents: i64,
        tip_cents: i64,
    ) -> SyncResult<RecordedPayment> {
        let now = Utc::now();
        let transaction_ref = ids::client_transaction_ref(now);
        let idempotency_key = ids::new_idempotency_key();

        let routed = self
            .route(|state| {
                let session_id = state.session()?.id.clone();
                state.record_payment(
                    order_id,
                    OrderPayment {
                        method,
                        amount_cents,
                        tip_cents,
                        transaction_ref: transaction_ref.clone(),
                        transaction_id: None,
                        recorded_at: now,
                    },
                )?;
                Ok(vec![Operation::ProcessPayment(ProcessPaymentPayload {
                    order_id: order_id.to_string(),
                    session_id,
                    method,
                    amount_cents,
                    tip_cents,
                    transaction_ref: transaction_ref.clone(),
                    idempotency_key: idempotency_key.clone(),
                })])
            })
            .await?;

        let transaction_id = routed.confirmations.iter().find_map(|c| match c {
            Confirmation::PaymentProcessed(receipt) => Some(receipt.transaction_id.clone()),
            _ => None,
        });
        info!(order_id, %transaction_ref, outcome = ?routed.outcome, "Payment recorded");
        Ok(RecordedPayment {
            transaction_ref,
            transaction_id,
            outcome: routed.outcome,
        })
    }

    /// Opens a cash-drawer session on this terminal.
    pub async fn start_session(&self, opening_balance_cents: i64) -> SyncResult<OpenedSession> {
        let placeholder = ids::new_placeholder();
        let idempotency_key = ids::new_idempotency_key();
        let now = Utc::now();

        let routed = self
            .route(|state| {
                validate_opening_balance(opening_balance_cents)?;
                state.open_session(Session {
                    id: placeholder.clone(),
                    sync_identifier: placeholder.clone(),
                    opening_balance_cents,
                    terminal_id: self.terminal_id.clone(),
                    opened_at: now,
                    is_synced: false,
                })?;
                Ok(vec![Operation::StartSession(StartSessionPayload {
                    client_reference: placeholder.clone(),
                    opening_balance_cents,
                    terminal_id: self.terminal_id.clone(),
                    idempotency_key: idempotency_key.clone(),
                })])
            })
            .await?;

        let session_id = routed.resolve(&placeholder);
        info!(%session_id, outcome = ?routed.outcome, "Session started");
        Ok(OpenedSession {
            session_id,
            outcome: routed.outcome,
        })
    }

    // =========================================================================
    // Offline Mode
    // =========================================================================

    /// Persists the offline-mode flag, then applies it to the monitor.
    pub async fn set_offline_mode(&self, enabled: bool) -> SyncResult<()> {
        self.apply_local(|state| {
            state.offline_mode = enabled;
            Ok(())
        })
        .await?;
        self.monitor.set_forced_offline(enabled);
        info!(enabled, "Offline mode set");
        Ok(())
    }

    /// ## Returns
    /// The new offline-mode flag.
    pub async fn toggle_offline_mode(&self) -> SyncResult<bool> {
        let enabled = self
            .apply_local(|state| {
                state.offline_mode = !state.offline_mode;
                Ok(state.offline_mode)
            })
            .await?;
        self.monitor.set_forced_offline(enabled);
        info!(enabled, "Offline mode toggled");
        Ok(enabled)
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Applies a local-only change. Persists only if the state changed.
    async fn apply_local<T>(
        &self,
        change: impl FnOnce(&mut PosState) -> CoreResult<T>,
    ) -> SyncResult<T> {
        let _command = self.command_lock.lock().await;
        let mut entities = self.entities.lock().await;
        let mut draft = entities.draft();
        let value = change(&mut draft)?;
        if draft != *entities.state() {
            entities.commit(draft).await?;
        }
        Ok(value)
    }

    /// Applies `build` to a draft and routes the operations it returns.
    async fn route(
        &self,
        build: impl Fn(&mut PosState) -> CoreResult<Vec<Operation>>,
    ) -> SyncResult<Routed> {
        let _command = self.command_lock.lock().await;

        let mut entities = self.entities.lock().await;
        let mut draft = entities.draft();
        let operations = build(&mut draft)?;

        if operations.is_empty() {
            if draft == *entities.state() {
                return Ok(Routed::local(CommandOutcome::Unchanged));
            }
            entities.commit(draft).await?;
            return Ok(Routed::local(CommandOutcome::Applied));
        }

        let direct = !self.mode.always_enqueues()
            && self.monitor.is_online()
            && self.queue.is_empty().await
            && operations.iter().all(|op| op.placeholder_refs().is_empty());

        if !direct {
            let sequence_ids = self
                .enqueue_and_commit(&mut entities, operations, draft)
                .await?;
            return Ok(Routed::local(CommandOutcome::Queued { sequence_ids }));
        }

        // No lock is held across remote calls.
        drop(entities);
        let sent = self.send_direct(operations).await?;

        let mut entities = self.entities.lock().await;
        let mut draft = entities.draft();
        build(&mut draft)?;
        for (operation, confirmation) in &sent.confirmed {
            reconcile(&mut draft, operation, confirmation);
        }

        let queued = if sent.leftovers.is_empty() {
            entities.commit(draft).await?;
            Vec::new()
        } else {
            self.enqueue_and_commit(&mut entities, sent.leftovers, draft)
                .await?
        };

        let mut rejected = Vec::with_capacity(sent.rejected.len());
        for (operation, detail) in sent.rejected {
            let letter = self.queue.record_rejected(operation, detail).await?;
            self.engine.report_rejected(&letter);
            rejected.push(letter.entry.sequence_id);
        }

        let outcome = match (rejected.is_empty(), queued.is_empty()) {
            (true, true) => CommandOutcome::Confirmed,
            (true, false) => CommandOutcome::Queued {
                sequence_ids: queued,
            },
            (false, _) => CommandOutcome::PartiallyRejected { rejected, queued },
        };

        Ok(Routed {
            outcome,
            remaps: sent.remaps,
            confirmations: sent.confirmed.into_iter().map(|(_, c)| c).collect(),
        })
    }

    /// Sends operations one by one. A terminal rejection of the first one
    /// aborts the command; of a later one, it is set aside for the
    /// dead-letter log. A retryable failure turns the rest into leftovers.
    async fn send_direct(&self, operations: Vec<Operation>) -> SyncResult<DirectResult> {
        let mut result = DirectResult::default();
        let mut pending = operations.into_iter();

        while let Some(mut operation) = pending.next() {
            for remap in &result.remaps {
                operation.rewrite(remap);
            }

            let call = tokio::time::timeout(
                self.command_timeout,
                dispatch(self.backend.as_ref(), &operation),
            )
            .await
            .unwrap_or(Err(BackendError::Timeout));

            match call {
                Ok(confirmation) => {
                    if let Some(remap) = confirmation.remap_for(&operation) {
                        result.remaps.push(remap);
                    }
                    result.confirmed.push((operation, confirmation));
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        kind = %operation.kind(),
                        error = %err,
                        "Direct call failed, falling back to the queue"
                    );
                    result.leftovers.push(operation);
                    result.leftovers.extend(pending.by_ref());
                    break;
                }
                Err(err) if result.confirmed.is_empty() => {
                    debug!(kind = %operation.kind(), error = %err, "Command rejected by backend");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(
                        kind = %operation.kind(),
                        subject = operation.subject(),
                        error = %err,
                        "Follow-up operation rejected"
                    );
                    result.rejected.push((operation, err.to_string()));
                }
            }
        }

        for leftover in &mut result.leftovers {
            for remap in &result.remaps {
                leftover.rewrite(remap);
            }
        }
        Ok(result)
    }

    /// Queues `operations` and commits `draft`. A failed commit retracts the
    /// queued operations.
    async fn enqueue_and_commit(
        &self,
        entities: &mut EntityGuard<'_>,
        operations: Vec<Operation>,
        draft: PosState,
    ) -> SyncResult<Vec<u64>> {
        let entries = self.queue.enqueue_batch(operations).await?;
        let sequence_ids: Vec<u64> = entries.iter().map(|e| e.sequence_id).collect();

        if let Err(err) = entities.commit(draft).await {
            if let Err(retract_err) = self.queue.retract(&sequence_ids).await {
                error!(?sequence_ids, error = %retract_err, "Failed to retract queued operations");
            }
            return Err(err.into());
        }

        debug!(?sequence_ids, "Operations queued");
        if self.monitor.is_online() {
            self.engine.request_drain();
        }
        Ok(sequence_ids)
    }
}

#[derive(Default)]
struct DirectResult {
    confirmed: Vec<(Operation, Confirmation)>,
    leftovers: Vec<Operation>,
    rejected: Vec<(Operation, String)>,
    remaps: Vec<IdRemap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{SyncEventEmitter, SyncStatus};
    use crate::engine::{Attention, AttentionKind};
    use crate::error::SyncError;
    use crate::simulated::SimulatedBackend;
    use std::sync::Mutex as StdMutex;
    use tally_core::{CoreError, DeadLetterReason, OperationKind};
    use tally_db::MemoryKvStore;

    #[derive(Default)]
    struct AttentionLog(StdMutex<Vec<Attention>>);

    impl SyncEventEmitter for AttentionLog {
        fn emit_status(&self, _status: &SyncStatus) {}
        fn emit_progress(&self, _pending: usize, _synced: u64) {}
        fn emit_error(&self, _message: &str, _retryable: bool) {}
        fn emit_attention(&self, attention: &Attention) {
            self.0.lock().unwrap().push(attention.clone());
        }
    }

    struct Harness {
        router: CommandRouter,
        attentions: Arc<AttentionLog>,
        kv: Arc<MemoryKvStore>,
        queue: Arc<PendingQueue>,
        backend: Arc<SimulatedBackend>,
        monitor: Arc<ConnectivityMonitor>,
    }

    async fn harness(online: bool, mode: RoutingMode) -> Harness {
        let kv = Arc::new(MemoryKvStore::new());
        let entities = Arc::new(EntityStore::load(kv.clone()).await.unwrap());
        let queue = Arc::new(PendingQueue::load(kv.clone()).await.unwrap());
        let backend = Arc::new(SimulatedBackend::new());
        let monitor = Arc::new(ConnectivityMonitor::new(online));

        let attentions = Arc::new(AttentionLog::default());

        let mut config = SyncConfig::new();
        config.sync.routing_mode = mode;
        let engine = Arc::new(SyncEngine::new(
            entities.clone(),
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            attentions.clone(),
            &config,
        ));
        let router = CommandRouter::new(
            entities,
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            engine,
            &config,
        );
        Harness {
            router,
            attentions,
            kv,
            queue,
            backend,
            monitor,
        }
    }

    fn burger() -> ProductSnapshot {
        ProductSnapshot::new("p-1", "Burger", 1200, 400)
    }

    #[tokio::test]
    async fn test_cart_commands_stay_local() {
        let h = harness(true, RoutingMode::Direct).await;

        let line = h.router.add_to_cart(burger(), 1, vec![], None).await.unwrap();
        let same = h.router.add_to_cart(burger(), 2, vec![], None).await.unwrap();
        assert_eq!(line, same);

        h.router.update_quantity(&line, 5).await.unwrap();
        assert_eq!(h.router.snapshot().await.cart.items[0].quantity, 5);

        h.router.update_quantity(&line, 0).await.unwrap();
        assert!(h.router.snapshot().await.cart.is_empty());

        assert!(h.queue.is_empty().await);
        assert!(h.backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_hold_and_recall_round_trip() {
        let h = harness(true, RoutingMode::Direct).await;
        h.router.add_to_cart(burger(), 1, vec![], None).await.unwrap();

        let held = h.router.hold_order().await.unwrap();
        assert!(h.router.snapshot().await.cart.is_empty());

        // Status changes on held orders never reach the backend.
        let outcome = h
            .router
            .update_order_status(&held, OrderStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Applied);

        h.router.recall_order(&held).await.unwrap();
        let state = h.router.snapshot().await;
        assert_eq!(state.cart.len(), 1);
        assert!(state.order(&held).is_none());
        assert!(h.backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_commands_are_queued_with_side_effects() {
        let h = harness(false, RoutingMode::Direct).await;
        h.router
            .load_tables(vec![Table::new("T4", "Table 4", 4)])
            .await
            .unwrap();
        h.router.start_session(10_000).await.unwrap();
        h.router.add_to_cart(burger(), 1, vec![], None).await.unwrap();
        h.router.set_table(Some("T4".into())).await.unwrap();

        let placed = h.router.create_order().await.unwrap();

        assert!(ids::is_placeholder(&placed.order_id));
        let kinds: Vec<_> = h.queue.drain().await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::StartSession,
                OperationKind::CreateOrder,
                OperationKind::UpdateTableStatus
            ]
        );
        let state = h.router.snapshot().await;
        assert_eq!(state.table("T4").unwrap().status, TableStatus::Occupied);
        assert!(state.cart.is_empty());
        assert!(h.backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_direct_path_returns_backend_ids() {
        let h = harness(true, RoutingMode::Direct).await;

        let session = h.router.start_session(0).await.unwrap();
        assert_eq!(session.session_id, "S1");
        assert_eq!(session.outcome, CommandOutcome::Confirmed);

        h.router.add_to_cart(burger(), 1, vec![], None).await.unwrap();
        let placed = h.router.create_order().await.unwrap();
        assert_eq!(placed.order_id, "R1");

        let payment = h
            .router
            .process_payment("R1", PaymentMethod::Cash, 1200, 0)
            .await
            .unwrap();
        assert_eq!(payment.transaction_id.as_deref(), Some("T1"));

        let state = h.router.snapshot().await;
        assert!(state.session().unwrap().is_synced);
        assert_eq!(
            state.order("R1").unwrap().payments[0].transaction_id.as_deref(),
            Some("T1")
        );
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_direct_rejection_applies_nothing() {
        let h = harness(true, RoutingMode::Direct).await;
        h.backend
            .fail_next(
                OperationKind::StartSession,
                BackendError::Rejected("drawer locked".into()),
            )
            .await;

        let err = h.router.start_session(0).await.unwrap_err();

        assert!(matches!(err, SyncError::Backend(BackendError::Rejected(_))));
        assert!(h.router.snapshot().await.current_session.is_none());
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_rejected_follow_up_is_dead_lettered_and_reported() {
        let h = harness(true, RoutingMode::Direct).await;
        h.router
            .load_tables(vec![Table::new("T4", "Table 4", 4)])
            .await
            .unwrap();
        h.router.start_session(0).await.unwrap();
        h.router.add_to_cart(burger(), 1, vec![], None).await.unwrap();
        h.router.set_table(Some("T4".into())).await.unwrap();
        h.backend
            .fail_next(
                OperationKind::UpdateTableStatus,
                BackendError::Rejected("table retired".into()),
            )
            .await;

        let placed = h.router.create_order().await.unwrap();

        assert_eq!(placed.order_id, "R1");
        let CommandOutcome::PartiallyRejected { rejected, queued } = placed.outcome else {
            panic!("outcome should report the rejected table update");
        };
        assert!(queued.is_empty());

        let letters = h.queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(rejected, vec![letters[0].entry.sequence_id]);
        assert_eq!(letters[0].reason, DeadLetterReason::Rejected);
        assert_eq!(letters[0].entry.kind(), OperationKind::UpdateTableStatus);
        assert!(h.queue.is_empty().await);

        let attentions = h.attentions.0.lock().unwrap().clone();
        assert_eq!(attentions.len(), 1);
        assert_eq!(attentions[0].cause, AttentionKind::Rejected);
        assert_eq!(attentions[0].kind, OperationKind::UpdateTableStatus);
        assert_eq!(attentions[0].sequence_id, rejected[0]);
    }

    #[tokio::test]
    async fn test_direct_timeout_degrades_to_queue() {
        let h = harness(true, RoutingMode::Direct).await;
        h.backend
            .fail_next(OperationKind::StartSession, BackendError::Timeout)
            .await;

        let session = h.router.start_session(0).await.unwrap();

        assert!(ids::is_placeholder(&session.session_id));
        assert!(matches!(session.outcome, CommandOutcome::Queued { .. }));
        assert_eq!(h.queue.len().await, 1);
        assert!(h.router.snapshot().await.current_session.is_some());
    }

    #[tokio::test]
    async fn test_offline_first_mode_always_queues() {
        let h = harness(true, RoutingMode::OfflineFirst).await;

        let session = h.router.start_session(0).await.unwrap();

        assert!(matches!(session.outcome, CommandOutcome::Queued { .. }));
        assert!(h.backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_applies_nothing() {
        let h = harness(false, RoutingMode::Direct).await;
        h.kv.set_fail_writes(true);

        assert!(h.router.start_session(0).await.unwrap_err().is_storage_error());
        h.kv.set_fail_writes(false);

        assert!(h.router.snapshot().await.current_session.is_none());
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_domain_errors_pass_through() {
        let h = harness(false, RoutingMode::Direct).await;

        let err = h.router.create_order().await.unwrap_err();
        assert!(matches!(err, SyncError::Domain(CoreError::NoActiveSession)));

        let err = h.router.start_session(-1).await.unwrap_err();
        assert!(matches!(err, SyncError::Domain(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_offline_mode_is_persisted_and_forced() {
        let h = harness(true, RoutingMode::Direct).await;

        assert!(h.router.toggle_offline_mode().await.unwrap());
        assert!(!h.monitor.is_online());
        assert!(h.router.snapshot().await.offline_mode);

        h.router.set_offline_mode(false).await.unwrap();
        assert!(h.monitor.is_online());
    }
}
