//! # Simulated Backend
//!
//! An in-process backend of record for the drill binary and the tests.
//!
//! ## Behaviour
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SimulatedBackend                                  │
//! │                                                                         │
//! │  call ──► log call ──► hook ──► latency ──► scripted fault? ──► apply  │
//! │                                                 │                       │
//! │                                    Before: fail, no effect              │
//! │                                    AfterCommit: apply, then fail        │
//! │                                                                         │
//! │  Ledger                                                                │
//! │  orders    R1, R2, ...   dedupe by client_reference                    │
//! │  sessions  S1, S2, ...   dedupe by idempotency_key                     │
//! │  payments  T1, T2, ...   dedupe by idempotency_key                     │
//! │  tables    last status per table id                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `AfterCommit` faults model a lost response: the effect is recorded but
//! the caller sees a failure and will re-send the same request.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use tally_core::operation::{
    CreateOrderPayload, OrderLine, ProcessPaymentPayload, StartSessionPayload,
    UpdateOrderStatusPayload, UpdateTableStatusPayload,
};
use tally_core::{ids, OperationKind, OrderStatus, PaymentMethod, TableStatus};

use crate::backend::{Backend, BackendError, PaymentReceipt, RemoteOrder, RemoteSession};

// =============================================================================
// Records
// =============================================================================

/// One request as the backend received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub kind: OperationKind,
    pub subject: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOrderRecord {
    pub id: String,
    pub session_id: String,
    pub lines: Vec<OrderLine>,
    pub table_id: Option<String>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePayment {
    pub transaction_id: String,
    pub order_id: String,
    pub session_id: String,
    pub method: PaymentMethod,
    pub amount_cents: i64,
    pub tip_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSessionRecord {
    pub id: String,
    pub sync_identifier: String,
    pub terminal_id: String,
    pub opening_balance_cents: i64,
}

/// Everything the backend holds, minus client-generated tokens. Two runs of
/// the same commands in the same order produce equal snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub orders: BTreeMap<String, RemoteOrderRecord>,
    pub sessions: BTreeMap<String, RemoteSessionRecord>,
    pub payments: Vec<RemotePayment>,
    pub tables: BTreeMap<String, TableStatus>,
}

#[derive(Debug, Clone)]
enum Fault {
    Before(BackendError),
    AfterCommit(BackendError),
}

type CallHook = Arc<dyn Fn(OperationKind, usize) + Send + Sync>;

#[derive(Default)]
struct Ledger {
    snapshot: RemoteSnapshot,
    next_order: u64,
    next_session: u64,
    next_transaction: u64,
    order_refs: HashMap<String, String>,
    session_keys: HashMap<String, String>,
    payment_keys: HashMap<String, String>,
    calls: Vec<BackendCall>,
    faults: HashMap<OperationKind, VecDeque<Fault>>,
    latency: Duration,
    hook: Option<CallHook>,
}

// =============================================================================
// Simulated Backend
// =============================================================================

#[derive(Default)]
pub struct SimulatedBackend {
    ledger: Mutex<Ledger>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers tables the backend already knows about.
    pub async fn seed_tables(&self, tables: impl IntoIterator<Item = (String, TableStatus)>) {
        self.ledger.lock().await.snapshot.tables.extend(tables);
    }

    /// The next call of `kind` fails with `error` and has no effect.
    pub async fn fail_next(&self, kind: OperationKind, error: BackendError) {
        self.push_fault(kind, Fault::Before(error)).await;
    }

    /// The next call of `kind` takes effect, then reports `error`.
    pub async fn fail_after_commit(&self, kind: OperationKind, error: BackendError) {
        self.push_fault(kind, Fault::AfterCommit(error)).await;
    }

    async fn push_fault(&self, kind: OperationKind, fault: Fault) {
        self.ledger
            .lock()
            .await
            .faults
            .entry(kind)
            .or_default()
            .push_back(fault);
    }

    /// Delay applied to every call before it takes effect.
    pub async fn set_latency(&self, latency: Duration) {
        self.ledger.lock().await.latency = latency;
    }

    /// Runs `hook(kind, call_number)` as each call arrives, before latency.
    pub async fn set_call_hook(&self, hook: impl Fn(OperationKind, usize) + Send + Sync + 'static) {
        self.ledger.lock().await.hook = Some(Arc::new(hook));
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.ledger.lock().await.calls.clone()
    }

    pub async fn calls_of(&self, kind: OperationKind) -> Vec<BackendCall> {
        self.ledger
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.kind == kind)
            .cloned()
            .collect()
    }

    pub async fn payments(&self) -> Vec<RemotePayment> {
        self.ledger.lock().await.snapshot.payments.clone()
    }

    pub async fn order(&self, id: &str) -> Option<RemoteOrderRecord> {
        self.ledger.lock().await.snapshot.orders.get(id).cloned()
    }

    pub async fn snapshot(&self) -> RemoteSnapshot {
        self.ledger.lock().await.snapshot.clone()
    }

    /// Logs the call, runs the hook and waits out the latency. Returns the
    /// scripted fault for this call, if any.
    async fn arrive(&self, call: BackendCall) -> Option<Fault> {
        let kind = call.kind;
        let (hook, latency, number, fault) = {
            let mut ledger = self.ledger.lock().await;
            debug!(%kind, subject = %call.subject, "Simulated backend call");
            ledger.calls.push(call);
            let fault = ledger.faults.get_mut(&kind).and_then(VecDeque::pop_front);
            (ledger.hook.clone(), ledger.latency, ledger.calls.len(), fault)
        };

        if let Some(hook) = hook {
            hook(kind, number);
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        fault
    }
}

/// Applies a call's effect under the scripted fault.
fn settle<T>(
    fault: Option<Fault>,
    apply: impl FnOnce() -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    match fault {
        Some(Fault::Before(err)) => Err(err),
        Some(Fault::AfterCommit(err)) => {
            apply()?;
            Err(err)
        }
        None => apply(),
    }
}

fn reject_placeholder(field: &str, id: &str) -> Result<(), BackendError> {
    if ids::is_placeholder(id) || ids::is_held(id) {
        return Err(BackendError::Rejected(format!(
            "{} '{}' is not a backend identifier",
            field, id
        )));
    }
    Ok(())
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn create_order(&self, payload: &CreateOrderPayload) -> Result<RemoteOrder, BackendError> {
        let fault = self
            .arrive(BackendCall {
                kind: OperationKind::CreateOrder,
                subject: payload.client_reference.clone(),
                idempotency_key: Some(payload.client_reference.clone()),
            })
            .await;

        let mut ledger = self.ledger.lock().await;
        settle(fault, || {
            if let Some(id) = ledger.order_refs.get(&payload.client_reference) {
                debug!(order_id = %id, "Duplicate create_order");
                return Ok(RemoteOrder { id: id.clone() });
            }
            reject_placeholder("session_id", &payload.session_id)?;
            if !ledger.snapshot.sessions.contains_key(&payload.session_id) {
                return Err(BackendError::Rejected(format!(
                    "unknown session {}",
                    payload.session_id
                )));
            }
            if payload.items.is_empty() {
                return Err(BackendError::Rejected("order has no lines".into()));
            }

            ledger.next_order += 1;
            let id = format!("R{}", ledger.next_order);
            ledger
                .order_refs
                .insert(payload.client_reference.clone(), id.clone());
            ledger.snapshot.orders.insert(
                id.clone(),
                RemoteOrderRecord {
                    id: id.clone(),
                    session_id: payload.session_id.clone(),
                    lines: payload.items.clone(),
                    table_id: payload.table_id.clone(),
                    status: OrderStatus::Open,
                },
            );
            info!(order_id = %id, "Simulated order created");
            Ok(RemoteOrder { id })
        })
    }

    async fn update_order_status(
        &self,
        payload: &UpdateOrderStatusPayload,
    ) -> Result<(), BackendError> {
        let fault = self
            .arrive(BackendCall {
                kind: OperationKind::UpdateOrderStatus,
                subject: payload.order_id.clone(),
                idempotency_key: None,
            })
            .await;

        let mut ledger = self.ledger.lock().await;
        settle(fault, || {
            reject_placeholder("order_id", &payload.order_id)?;
            let order = ledger
                .snapshot
                .orders
                .get_mut(&payload.order_id)
                .ok_or_else(|| {
                    BackendError::Rejected(format!("unknown order {}", payload.order_id))
                })?;
            if !order.status.can_transition_to(payload.status) {
                return Err(BackendError::Conflict(format!(
                    "order {} cannot move from {} to {}",
                    order.id, order.status, payload.status
                )));
            }
            order.status = payload.status;
            Ok(())
        })
    }

    async fn update_table_status(
        &self,
        payload: &UpdateTableStatusPayload,
    ) -> Result<(), BackendError> {
        let fault = self
            .arrive(BackendCall {
                kind: OperationKind::UpdateTableStatus,
                subject: payload.table_id.clone(),
                idempotency_key: None,
            })
            .await;

        let mut ledger = self.ledger.lock().await;
        settle(fault, || {
            ledger
                .snapshot
                .tables
                .insert(payload.table_id.clone(), payload.status);
            Ok(())
        })
    }

    async fn process_payment(
        &self,
        payload: &ProcessPaymentPayload,
    ) -> Result<PaymentReceipt, BackendError> {
        let fault = self
            .arrive(BackendCall {
                kind: OperationKind::ProcessPayment,
                subject: payload.order_id.clone(),
                idempotency_key: Some(payload.idempotency_key.clone()),
            })
            .await;

        let mut ledger = self.ledger.lock().await;
        settle(fault, || {
            if let Some(transaction_id) = ledger.payment_keys.get(&payload.idempotency_key) {
                debug!(%transaction_id, "Duplicate process_payment");
                return Ok(PaymentReceipt {
                    success: true,
                    transaction_id: transaction_id.clone(),
                });
            }
            reject_placeholder("order_id", &payload.order_id)?;
            reject_placeholder("session_id", &payload.session_id)?;
            match ledger.snapshot.orders.get(&payload.order_id) {
                None => {
                    return Err(BackendError::Rejected(format!(
                        "unknown order {}",
                        payload.order_id
                    )))
                }
                Some(order) if order.status == OrderStatus::Cancelled => {
                    return Err(BackendError::Rejected(format!(
                        "order {} is cancelled",
                        order.id
                    )))
                }
                Some(_) => {}
            }
            if payload.amount_cents <= 0 {
                return Ok(PaymentReceipt {
                    success: false,
                    transaction_id: String::new(),
                });
            }

            ledger.next_transaction += 1;
            let transaction_id = format!("T{}", ledger.next_transaction);
            ledger
                .payment_keys
                .insert(payload.idempotency_key.clone(), transaction_id.clone());
            ledger.snapshot.payments.push(RemotePayment {
                transaction_id: transaction_id.clone(),
                order_id: payload.order_id.clone(),
                session_id: payload.session_id.clone(),
                method: payload.method,
                amount_cents: payload.amount_cents,
                tip_cents: payload.tip_cents,
            });
            info!(%transaction_id, order_id = %payload.order_id, "Simulated payment recorded");
            Ok(PaymentReceipt {
                success: true,
                transaction_id,
            })
        })
    }

    async fn start_session(
        &self,
        payload: &StartSessionPayload,
    ) -> Result<RemoteSession, BackendError> {
        let fault = self
            .arrive(BackendCall {
                kind: OperationKind::StartSession,
                subject: payload.client_reference.clone(),
                idempotency_key: Some(payload.idempotency_key.clone()),
            })
            .await;

        let mut ledger = self.ledger.lock().await;
        settle(fault, || {
            if let Some(id) = ledger.session_keys.get(&payload.idempotency_key) {
                let session = ledger.snapshot.sessions.get(id).ok_or_else(|| {
                    BackendError::Unavailable(format!("session {} missing from ledger", id))
                })?;
                return Ok(RemoteSession {
                    id: session.id.clone(),
                    sync_identifier: session.sync_identifier.clone(),
                });
            }
            if payload.opening_balance_cents < 0 {
                return Err(BackendError::Rejected("negative opening balance".into()));
            }

            ledger.next_session += 1;
            let id = format!("S{}", ledger.next_session);
            let sync_identifier = format!("sync-{}", id);
            ledger
                .session_keys
                .insert(payload.idempotency_key.clone(), id.clone());
            ledger.snapshot.sessions.insert(
                id.clone(),
                RemoteSessionRecord {
                    id: id.clone(),
                    sync_identifier: sync_identifier.clone(),
                    terminal_id: payload.terminal_id.clone(),
                    opening_balance_cents: payload.opening_balance_cents,
                },
            );
            info!(session_id = %id, "Simulated session started");
            Ok(RemoteSession {
                id,
                sync_identifier,
            })
        })
    }
}
