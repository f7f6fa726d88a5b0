//! # Sync Engine
//!
//! Replays the pending-operation queue against the backend, strictly in
//! `sequence_id` order, one remote call at a time.
//!
//! ## Drain Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Drain Pass                                     │
//! │                                                                         │
//! │   head() ──► none ──────────────────────────────────► Idle (Completed) │
//! │     │                                                                   │
//! │     ├──► unresolved placeholder ──► quarantine ──► next head           │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │   dispatch under call_timeout ◄──── went offline ──► Idle (Cancelled)  │
//! │     │                                                                   │
//! │     ├──► Ok ───────────► entities: reconcile + commit                  │
//! │     │                    queue:    confirm(seq, remap) ──► next head   │
//! │     │                                                                   │
//! │     ├──► retryable ────► attempts += 1 ──► Stalled(Retrying) + timer   │
//! │     │                                                                   │
//! │     └──► terminal ─┬──► blocking kind ──► Stalled(NeedsAttention)      │
//! │                    └──► otherwise ──────► dead letter ──► next head    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locks
//! Entity Store before Queue, never held across a remote call.
//!
//! ## Triggers
//! Manual [`SyncEngine::drain`] also retries a blocked head. Automatic
//! triggers ([`SyncEngine::resume`]: reconnect, retry timer, router kick)
//! leave a blocked head alone until an operator acts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tally_core::operation::UpdateTableStatusPayload;
use tally_core::{
    DeadLetter, DeadLetterReason, Operation, OperationKind, PendingOperation, TableStatus,
};
use tally_db::{EntityStore, PendingQueue};

use crate::agent::SyncEventEmitter;
use crate::backend::{dispatch, reconcile, Backend, BackendError, Confirmation};
use crate::config::SyncConfig;
use crate::connectivity::{wait_offline, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Engine State
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    /// A retryable failure; a timer will trigger the next pass.
    Retrying {
        sequence_id: u64,
        attempts: u32,
        retry_in: Duration,
    },
    /// A blocking operation was rejected; waits for an operator.
    NeedsAttention { sequence_id: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Draining,
    Stalled(StallReason),
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Draining => write!(f, "draining"),
            EngineState::Stalled(StallReason::Retrying { .. }) => write!(f, "retrying"),
            EngineState::Stalled(StallReason::NeedsAttention { .. }) => {
                write!(f, "needs_attention")
            }
        }
    }
}

/// How a drain pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed { confirmed: usize },
    /// Another pass was already running; nothing was done.
    AlreadyRunning,
    /// The terminal was offline when the pass was requested.
    Offline,
    /// The terminal went offline during the pass.
    Cancelled { confirmed: usize },
    Stalled {
        confirmed: usize,
        sequence_id: u64,
        reason: String,
    },
}

impl DrainOutcome {
    pub fn confirmed(&self) -> usize {
        match self {
            DrainOutcome::Completed { confirmed }
            | DrainOutcome::Cancelled { confirmed }
            | DrainOutcome::Stalled { confirmed, .. } => *confirmed,
            DrainOutcome::AlreadyRunning | DrainOutcome::Offline => 0,
        }
    }
}

// =============================================================================
// Attention Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    /// Rejected and moved to the dead-letter log.
    Rejected,
    /// Referenced a placeholder that can no longer be resolved.
    Quarantined,
    /// A blocking operation was rejected and halts the drain.
    Blocked,
    /// Still retrying, but past the configured retry ceiling.
    RetryCeiling,
}

/// Something an operator should look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attention {
    pub sequence_id: u64,
    pub kind: OperationKind,
    pub cause: AttentionKind,
    pub detail: String,
}

impl Attention {
    fn new(entry: &PendingOperation, cause: AttentionKind, detail: impl Into<String>) -> Self {
        Attention {
            sequence_id: entry.sequence_id,
            kind: entry.kind(),
            cause,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Automatic,
}

/// Clears the draining flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

pub struct SyncEngine {
    entities: Arc<EntityStore>,
    queue: Arc<PendingQueue>,
    backend: Arc<dyn Backend>,
    monitor: Arc<ConnectivityMonitor>,
    emitter: Arc<dyn SyncEventEmitter>,

    call_timeout: Duration,
    retry_ceiling: u32,
    max_backoff: Duration,

    draining: AtomicBool,
    synced_total: AtomicU64,
    state: watch::Sender<EngineState>,
    backoff: Mutex<ExponentialBackoff>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    wake: Arc<Notify>,
}

impl SyncEngine {
    pub fn new(
        entities: Arc<EntityStore>,
        queue: Arc<PendingQueue>,
        backend: Arc<dyn Backend>,
        monitor: Arc<ConnectivityMonitor>,
        emitter: Arc<dyn SyncEventEmitter>,
        config: &SyncConfig,
    ) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: config.initial_backoff(),
            max_interval: config.max_backoff(),
            multiplier: config.sync.backoff_multiplier,
            max_elapsed_time: None,
            ..Default::default()
        };

        SyncEngine {
            entities,
            queue,
            backend,
            monitor,
            emitter,
            call_timeout: config.call_timeout(),
            retry_ceiling: config.sync.retry_ceiling,
            max_backoff: config.max_backoff(),
            draining: AtomicBool::new(false),
            synced_total: AtomicU64::new(0),
            state: watch::Sender::new(EngineState::Idle),
            backoff: Mutex::new(backoff),
            retry_task: Mutex::new(None),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Operations confirmed since this engine was created.
    pub fn synced_total(&self) -> u64 {
        self.synced_total.load(Ordering::Relaxed)
    }

    /// Notified when a drain should run: retry timers, router kicks and
    /// operator actions.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Asks whoever listens on [`Self::wake_handle`] to run a pass.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    /// "Sync now". Also re-sends a blocked head.
    pub async fn drain(&self) -> DrainOutcome {
        self.run(Trigger::Manual).await
    }

    /// Drain for reconnects, retry timers and router kicks.
    pub async fn resume(&self) -> DrainOutcome {
        self.run(Trigger::Automatic).await
    }

    /// Aborts a scheduled retry. A `Retrying` stall returns to `Idle`.
    pub async fn cancel_retry(&self) {
        if let Some(task) = self.retry_task.lock().await.take() {
            task.abort();
            debug!("Scheduled retry cancelled");
        }
        self.state.send_if_modified(|state| {
            if matches!(state, EngineState::Stalled(StallReason::Retrying { .. })) {
                *state = EngineState::Idle;
                return true;
            }
            false
        });
    }

    // =========================================================================
    // Drain Pass
    // =========================================================================

    async fn run(&self, trigger: Trigger) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already running");
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = DrainGuard(&self.draining);

        if let EngineState::Stalled(StallReason::NeedsAttention {
            sequence_id,
            reason,
        }) = self.state()
        {
            let head = self.queue.head().await.map(|entry| entry.sequence_id);
            if trigger == Trigger::Automatic && head == Some(sequence_id) {
                debug!(sequence_id, "Head still needs attention, skipping automatic drain");
                return DrainOutcome::Stalled {
                    confirmed: 0,
                    sequence_id,
                    reason,
                };
            }
            if !self.monitor.is_online() {
                return DrainOutcome::Offline;
            }
        }

        if !self.monitor.is_online() {
            self.state.send_replace(EngineState::Idle);
            debug!("Offline, drain skipped");
            return DrainOutcome::Offline;
        }

        self.cancel_retry().await;
        self.state.send_replace(EngineState::Draining);
        let pending = self.queue.len().await;
        info!(pending, ?trigger, "Drain started");

        let mut offline = self.monitor.watch_online();
        let mut confirmed = 0;

        loop {
            let Some(entry) = self.queue.head().await else {
                self.backoff.lock().await.reset();
                self.state.send_replace(EngineState::Idle);
                info!(confirmed, "Queue drained");
                return DrainOutcome::Completed { confirmed };
            };

            if !self.monitor.is_online() {
                self.state.send_replace(EngineState::Idle);
                info!(confirmed, "Offline, drain cancelled");
                return DrainOutcome::Cancelled { confirmed };
            }

            let unresolved: Vec<String> = entry
                .operation
                .placeholder_refs()
                .into_iter()
                .map(str::to_string)
                .collect();
            if !unresolved.is_empty() {
                let detail = format!("unresolved placeholder(s): {}", unresolved.join(", "));
                error!(
                    sequence_id = entry.sequence_id,
                    kind = %entry.kind(),
                    %detail,
                    "Operation can never be replayed, quarantining"
                );
                if let Err(err) = self
                    .retire(&entry, DeadLetterReason::Quarantined, &detail)
                    .await
                {
                    return self.stall_on_storage(&entry, err, confirmed).await;
                }
                self.emitter.emit_attention(&Attention::new(
                    &entry,
                    AttentionKind::Quarantined,
                    detail,
                ));
                continue;
            }

            let call = tokio::time::timeout(
                self.call_timeout,
                dispatch(self.backend.as_ref(), &entry.operation),
            );
            let result = tokio::select! {
                biased;
                _ = wait_offline(&mut offline) => {
                    warn!(
                        sequence_id = entry.sequence_id,
                        kind = %entry.kind(),
                        "Went offline mid-call, in-flight request dropped"
                    );
                    self.cancel_retry().await;
                    self.state.send_replace(EngineState::Idle);
                    return DrainOutcome::Cancelled { confirmed };
                }
                result = call => match result {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout),
                },
            };

            match result {
                Ok(confirmation) => {
                    if let Err(err) = self.confirm(&entry, &confirmation).await {
                        return self.stall_on_storage(&entry, err, confirmed).await;
                    }
                    confirmed += 1;
                    let synced = self.synced_total.fetch_add(1, Ordering::Relaxed) + 1;
                    self.backoff.lock().await.reset();
                    self.emitter.emit_progress(self.queue.len().await, synced);
                }
                Err(err) if err.is_retryable() => {
                    return self.stall_retryable(&entry, err, confirmed).await;
                }
                Err(err) if entry.kind().is_blocking() => {
                    return self.block(&entry, err, confirmed).await;
                }
                Err(err) => {
                    let detail = err.to_string();
                    warn!(
                        sequence_id = entry.sequence_id,
                        kind = %entry.kind(),
                        error = %detail,
                        "Operation rejected, moving to dead letters"
                    );
                    if let Err(err) = self
                        .retire(&entry, DeadLetterReason::Rejected, &detail)
                        .await
                    {
                        return self.stall_on_storage(&entry, err, confirmed).await;
                    }
                    self.emitter.emit_attention(&Attention::new(
                        &entry,
                        AttentionKind::Rejected,
                        detail,
                    ));
                }
            }
        }
    }

    /// Folds a confirmation into the entities, then drops the operation and
    /// rewrites later ones.
    async fn confirm(
        &self,
        entry: &PendingOperation,
        confirmation: &Confirmation,
    ) -> SyncResult<()> {
        let remap = confirmation.remap_for(&entry.operation);

        let mut entities = self.entities.lock().await;
        let mut next = entities.draft();
        reconcile(&mut next, &entry.operation, confirmation);
        if next != *entities.state() {
            entities.commit(next).await?;
        }

        let rewritten = self.queue.confirm(entry.sequence_id, remap.as_ref()).await?;
        debug!(
            sequence_id = entry.sequence_id,
            kind = %entry.kind(),
            rewritten,
            "Operation confirmed"
        );
        Ok(())
    }

    /// Removes an operation that will never be confirmed, along with the
    /// local entity it would have created.
    async fn retire(
        &self,
        entry: &PendingOperation,
        reason: DeadLetterReason,
        detail: &str,
    ) -> SyncResult<DeadLetter> {
        let mut entities = self.entities.lock().await;
        let mut next = entities.draft();
        let released = entry
            .operation
            .produced_placeholder()
            .and_then(|placeholder| next.drop_unsynced(placeholder));
        if next != *entities.state() {
            entities.commit(next).await?;
        }

        let letter = self
            .queue
            .dead_letter(entry.sequence_id, reason, detail)
            .await?;
        if let Some(table_id) = released {
            info!(%table_id, "Releasing table of dropped order");
            self.queue
                .enqueue(Operation::UpdateTableStatus(UpdateTableStatusPayload {
                    table_id,
                    status: TableStatus::Available,
                }))
                .await?;
        }
        Ok(letter)
    }

    async fn stall_retryable(
        &self,
        entry: &PendingOperation,
        err: BackendError,
        confirmed: usize,
    ) -> DrainOutcome {
        let reason = err.to_string();
        let attempts = match self.queue.record_failure(entry.sequence_id, &reason).await {
            Ok(attempts) => attempts,
            Err(db_err) => {
                error!(sequence_id = entry.sequence_id, error = %db_err, "Failed to record attempt");
                entry.attempts
            }
        };

        if attempts == self.retry_ceiling.saturating_add(1) {
            warn!(
                sequence_id = entry.sequence_id,
                attempts,
                ceiling = self.retry_ceiling,
                "Operation past retry ceiling"
            );
            self.emitter.emit_attention(&Attention::new(
                entry,
                AttentionKind::RetryCeiling,
                reason.clone(),
            ));
        }

        let retry_in = self.schedule_retry().await;
        warn!(
            sequence_id = entry.sequence_id,
            kind = %entry.kind(),
            attempts,
            retry_in_ms = retry_in.as_millis() as u64,
            error = %reason,
            "Retryable failure, drain stalled"
        );
        self.state
            .send_replace(EngineState::Stalled(StallReason::Retrying {
                sequence_id: entry.sequence_id,
                attempts,
                retry_in,
            }));
        self.emitter.emit_error(&reason, true);

        DrainOutcome::Stalled {
            confirmed,
            sequence_id: entry.sequence_id,
            reason,
        }
    }

    async fn stall_on_storage(
        &self,
        entry: &PendingOperation,
        err: SyncError,
        confirmed: usize,
    ) -> DrainOutcome {
        let reason = err.to_string();
        error!(
            sequence_id = entry.sequence_id,
            kind = %entry.kind(),
            error = %reason,
            "Local write failed during drain"
        );

        let retry_in = self.schedule_retry().await;
        self.state
            .send_replace(EngineState::Stalled(StallReason::Retrying {
                sequence_id: entry.sequence_id,
                attempts: entry.attempts,
                retry_in,
            }));
        self.emitter.emit_error(&reason, true);

        DrainOutcome::Stalled {
            confirmed,
            sequence_id: entry.sequence_id,
            reason,
        }
    }

    async fn block(
        &self,
        entry: &PendingOperation,
        err: BackendError,
        confirmed: usize,
    ) -> DrainOutcome {
        let reason = err.to_string();
        if let Err(db_err) = self.queue.record_failure(entry.sequence_id, &reason).await {
            error!(sequence_id = entry.sequence_id, error = %db_err, "Failed to record attempt");
        }
        error!(
            sequence_id = entry.sequence_id,
            kind = %entry.kind(),
            error = %reason,
            "Blocking operation rejected, drain halted"
        );

        self.state
            .send_replace(EngineState::Stalled(StallReason::NeedsAttention {
                sequence_id: entry.sequence_id,
                reason: reason.clone(),
            }));
        self.emitter
            .emit_attention(&Attention::new(entry, AttentionKind::Blocked, reason.clone()));
        self.emitter.emit_error(&reason, false);

        DrainOutcome::Stalled {
            confirmed,
            sequence_id: entry.sequence_id,
            reason,
        }
    }

    /// Starts the retry timer with the next backoff delay.
    ///
    /// Jitter is applied after the interval is capped, so the delay is
    /// clamped again to stay within `max_backoff`.
    async fn schedule_retry(&self) -> Duration {
        let delay = self
            .backoff
            .lock()
            .await
            .next_backoff()
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff));

        let wake = self.wake.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
        if let Some(previous) = self.retry_task.lock().await.replace(task) {
            previous.abort();
        }
        delay
    }

    // =========================================================================
    // Operator Actions
    // =========================================================================

    /// Drops the blocked head operation into the dead-letter log, along with
    /// the local entity it would have created, and lets the drain continue.
    pub async fn discard_blocked(&self, sequence_id: u64) -> SyncResult<DeadLetter> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::NotBlocked(sequence_id));
        }
        let _guard = DrainGuard(&self.draining);

        let blocked = matches!(
            self.state(),
            EngineState::Stalled(StallReason::NeedsAttention { sequence_id: seq, .. })
                if seq == sequence_id
        );
        let entry = match self.queue.head().await {
            Some(entry) if blocked && entry.sequence_id == sequence_id => entry,
            _ => return Err(SyncError::NotBlocked(sequence_id)),
        };

        let letter = self
            .retire(&entry, DeadLetterReason::Discarded, "discarded by operator")
            .await?;
        info!(sequence_id, kind = %entry.kind(), "Blocked operation discarded");

        self.state.send_replace(EngineState::Idle);
        self.emitter
            .emit_progress(self.queue.len().await, self.synced_total());
        self.wake.notify_one();
        Ok(letter)
    }

    /// Surfaces an operation the router sent directly and the backend
    /// rejected after an earlier part of the same command was confirmed.
    pub(crate) fn report_rejected(&self, letter: &DeadLetter) {
        self.emitter.emit_attention(&Attention::new(
            &letter.entry,
            AttentionKind::Rejected,
            letter.detail.clone(),
        ));
    }

    /// Returns an error naming the blocked head, if there is one.
    pub fn ensure_unblocked(&self) -> SyncResult<()> {
        match self.state() {
            EngineState::Stalled(StallReason::NeedsAttention {
                sequence_id,
                reason,
            }) => Err(SyncError::Blocked {
                sequence_id,
                reason,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoOpEmitter;
    use crate::simulated::SimulatedBackend;
    use tally_core::operation::StartSessionPayload;
    use tally_db::MemoryKvStore;

    struct Harness {
        engine: SyncEngine,
        queue: Arc<PendingQueue>,
        backend: Arc<SimulatedBackend>,
        monitor: Arc<ConnectivityMonitor>,
    }

    async fn harness(online: bool) -> Harness {
        harness_with(online, SyncConfig::new()).await
    }

    async fn harness_with(online: bool, config: SyncConfig) -> Harness {
        let kv = Arc::new(MemoryKvStore::new());
        let entities = Arc::new(EntityStore::load(kv.clone()).await.unwrap());
        let queue = Arc::new(PendingQueue::load(kv).await.unwrap());
        let backend = Arc::new(SimulatedBackend::new());
        let monitor = Arc::new(ConnectivityMonitor::new(online));
        let engine = SyncEngine::new(
            entities,
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            Arc::new(NoOpEmitter),
            &config,
        );
        Harness {
            engine,
            queue,
            backend,
            monitor,
        }
    }

    fn start_session(key: &str) -> Operation {
        Operation::StartSession(StartSessionPayload {
            client_reference: format!("local-{}", key),
            opening_balance_cents: 0,
            terminal_id: "till-1".into(),
            idempotency_key: key.into(),
        })
    }

    #[tokio::test]
    async fn test_offline_drain_is_a_noop() {
        let h = harness(false).await;
        h.queue.enqueue(start_session("a")).await.unwrap();

        assert_eq!(h.engine.drain().await, DrainOutcome::Offline);
        assert!(h.backend.calls().await.is_empty());
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let h = harness(true).await;
        assert_eq!(h.engine.drain().await, DrainOutcome::Completed { confirmed: 0 });
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_stalls_and_keeps_head() {
        let h = harness(true).await;
        let entry = h.queue.enqueue(start_session("a")).await.unwrap();
        h.queue.enqueue(start_session("b")).await.unwrap();
        h.backend
            .fail_next(OperationKind::StartSession, BackendError::Timeout)
            .await;

        let outcome = h.engine.drain().await;

        assert!(matches!(outcome, DrainOutcome::Stalled { confirmed: 0, sequence_id, .. } if sequence_id == entry.sequence_id));
        assert!(matches!(
            h.engine.state(),
            EngineState::Stalled(StallReason::Retrying { attempts: 1, .. })
        ));
        assert_eq!(h.queue.head().await.unwrap().attempts, 1);
        assert_eq!(h.backend.calls().await.len(), 1);

        // The retry timer wakes the drain.
        let wake = h.engine.wake_handle();
        tokio::time::timeout(Duration::from_secs(5), wake.notified())
            .await
            .unwrap();
        assert_eq!(h.engine.drain().await, DrainOutcome::Completed { confirmed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_never_exceeds_max_backoff() {
        let mut config = SyncConfig::new();
        config.sync.initial_backoff_ms = 1_000;
        config.sync.max_backoff_secs = 1;
        let h = harness_with(true, config).await;
        h.queue.enqueue(start_session("a")).await.unwrap();

        for _ in 0..40 {
            h.backend
                .fail_next(
                    OperationKind::StartSession,
                    BackendError::Unavailable("503".into()),
                )
                .await;
            assert!(matches!(h.engine.drain().await, DrainOutcome::Stalled { .. }));

            let EngineState::Stalled(StallReason::Retrying { retry_in, .. }) = h.engine.state()
            else {
                panic!("drain should be waiting to retry");
            };
            assert!(retry_in <= Duration::from_secs(1), "retry_in = {:?}", retry_in);
        }
    }

    #[test]
    fn test_drain_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let h = runtime.block_on(harness(true));
        assert_send(&h.engine.drain());
        assert_send(&h.engine.resume());
        assert_send(&h.engine.discard_blocked(1));
    }

    #[tokio::test]
    async fn test_blocked_head_waits_for_operator() {
        let h = harness(true).await;
        let entry = h.queue.enqueue(start_session("a")).await.unwrap();
        h.backend
            .fail_next(
                OperationKind::StartSession,
                BackendError::Rejected("terminal unknown".into()),
            )
            .await;

        assert!(matches!(h.engine.drain().await, DrainOutcome::Stalled { .. }));
        assert!(h.engine.ensure_unblocked().is_err());

        // Automatic triggers do not re-send it.
        assert!(matches!(h.engine.resume().await, DrainOutcome::Stalled { .. }));
        assert_eq!(h.backend.calls().await.len(), 1);

        // A manual drain does.
        assert_eq!(h.engine.drain().await, DrainOutcome::Completed { confirmed: 1 });
        assert_eq!(h.backend.calls().await.len(), 2);
        assert!(h.queue.dead_letters().await.is_empty());
        assert_ne!(h.queue.head().await.map(|e| e.sequence_id), Some(entry.sequence_id));
    }

    #[tokio::test]
    async fn test_discard_requires_blocked_head() {
        let h = harness(true).await;
        let entry = h.queue.enqueue(start_session("a")).await.unwrap();

        assert!(matches!(
            h.engine.discard_blocked(entry.sequence_id).await,
            Err(SyncError::NotBlocked(_))
        ));

        h.backend
            .fail_next(OperationKind::StartSession, BackendError::Conflict("dup".into()))
            .await;
        h.engine.drain().await;

        let letter = h.engine.discard_blocked(entry.sequence_id).await.unwrap();
        assert_eq!(letter.reason, DeadLetterReason::Discarded);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_going_offline_keeps_blocked_state() {
        let h = harness(true).await;
        h.queue.enqueue(start_session("a")).await.unwrap();
        h.backend
            .fail_next(OperationKind::StartSession, BackendError::Rejected("no".into()))
            .await;
        h.engine.drain().await;

        h.monitor.report_reachability(false);
        assert_eq!(h.engine.drain().await, DrainOutcome::Offline);
        assert!(matches!(
            h.engine.state(),
            EngineState::Stalled(StallReason::NeedsAttention { .. })
        ));
    }
}
