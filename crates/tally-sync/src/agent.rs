//! # Sync Agent
//!
//! Owns the stores, the monitor, the engine and the router, and runs the
//! background loop that turns connectivity changes into drain passes.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • Loads EntityStore + PendingQueue from one KvStore             │  │
//! │  │  • Drains once at start when online                              │  │
//! │  │  • WentOnline / wake ──► engine.resume()                         │  │
//! │  │  • WentOffline ──► cancel scheduled retries                      │  │
//! │  │  • Publishes SyncStatus to the host                              │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Connectivity   │  │  SyncEngine    │  │   CommandRouter        │    │
//! │  │ Monitor        │  │                │  │                        │    │
//! │  │ + check task   │  │ Replays the    │  │ Terminal commands      │    │
//! │  │                │  │ queue          │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  STATUS EVENTS (to host):                                              │
//! │  ────────────────────────                                              │
//! │  emit_status     - SyncStatus after every pass and transition          │
//! │  emit_progress   - { pending: 3, synced: 12 }                          │
//! │  emit_error      - { message: "Backend call timed out", retryable }    │
//! │  emit_attention  - rejected, quarantined or blocked operations         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tally_core::DeadLetter;
use tally_db::{Database, DbConfig, EntityStore, KvStore, PendingQueue};

use crate::backend::Backend;
use crate::config::{RoutingMode, SyncConfig};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, ReachabilityCheck};
use crate::engine::{Attention, DrainOutcome, EngineState, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::router::CommandRouter;

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Effective connectivity (reachable and not forced offline).
    pub is_online: bool,

    pub forced_offline: bool,

    pub engine: EngineState,

    /// Operations waiting in the queue.
    pub pending_count: usize,

    /// Queued operations past the retry ceiling.
    pub needs_attention: usize,

    pub dead_letters: usize,

    /// Last pass that confirmed at least one operation.
    pub last_sync: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub routing_mode: RoutingMode,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            is_online: false,
            forced_offline: false,
            engine: EngineState::Idle,
            pending_count: 0,
            needs_attention: 0,
            dead_letters: 0,
            last_sync: None,
            last_error: None,
            routing_mode: RoutingMode::default(),
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Trait for emitting sync events to the host UI.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a sync progress event.
    fn emit_progress(&self, pending: usize, synced: u64);

    /// Emits a sync error event.
    fn emit_error(&self, message: &str, retryable: bool);

    /// Reports an operation an operator should look at.
    fn emit_attention(&self, attention: &Attention);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: usize, _synced: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_attention(&self, _attention: &Attention) {}
}

// =============================================================================
// Shared Runtime
// =============================================================================

/// What the background loop and the agent both need.
struct Runtime {
    queue: Arc<PendingQueue>,
    monitor: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    emitter: Arc<dyn SyncEventEmitter>,
    status: Arc<RwLock<SyncStatus>>,
    retry_ceiling: u32,
}

impl Runtime {
    async fn drain(&self, manual: bool) -> DrainOutcome {
        let outcome = if manual {
            self.engine.drain().await
        } else {
            self.engine.resume().await
        };
        debug!(?outcome, "Drain pass finished");
        self.refresh(Some(&outcome)).await;
        outcome
    }

    /// Recomputes the status and publishes it.
    async fn refresh(&self, outcome: Option<&DrainOutcome>) -> SyncStatus {
        let pending_count = self.queue.len().await;
        let needs_attention = self.queue.peek_failures(self.retry_ceiling).await.len();
        let dead_letters = self.queue.dead_letters().await.len();

        let mut status = self.status.write().await;
        status.is_online = self.monitor.is_online();
        status.forced_offline = self.monitor.is_forced_offline();
        status.engine = self.engine.state();
        status.pending_count = pending_count;
        status.needs_attention = needs_attention;
        status.dead_letters = dead_letters;

        match outcome {
            Some(DrainOutcome::Stalled {
                confirmed, reason, ..
            }) => {
                if *confirmed > 0 {
                    status.last_sync = Some(Utc::now());
                }
                status.last_error = Some(reason.clone());
            }
            Some(outcome) if outcome.confirmed() > 0 => {
                status.last_sync = Some(Utc::now());
                status.last_error = None;
            }
            Some(DrainOutcome::Completed { .. }) => status.last_error = None,
            _ => {}
        }

        let snapshot = status.clone();
        drop(status);
        self.emitter.emit_status(&snapshot);
        snapshot
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ConnectivityEvent>,
        wake: Arc<Notify>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Sync loop received shutdown");
                    break;
                }

                event = events.recv() => match event {
                    Ok(ConnectivityEvent::WentOnline) => {
                        info!("Back online, draining");
                        self.drain(false).await;
                    }
                    Ok(ConnectivityEvent::WentOffline) => {
                        self.engine.cancel_retry().await;
                        self.refresh(None).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connectivity events lagged");
                        if self.monitor.is_online() {
                            self.drain(false).await;
                        } else {
                            self.engine.cancel_retry().await;
                            self.refresh(None).await;
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Connectivity monitor closed");
                        break;
                    }
                },

                _ = wake.notified() => {
                    if self.monitor.is_online() {
                        self.drain(false).await;
                    } else {
                        debug!("Drain requested while offline");
                    }
                }
            }
        }

        info!("Sync loop stopped");
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

pub struct SyncAgent {
    config: Arc<SyncConfig>,
    entities: Arc<EntityStore>,
    router: Arc<CommandRouter>,
    runtime: Arc<Runtime>,
    reachability: Option<Arc<dyn ReachabilityCheck>>,

    shutdown_tx: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncAgent {
    pub fn builder(config: SyncConfig) -> SyncAgentBuilder {
        SyncAgentBuilder::new(config)
    }

    /// Starts the background loop. Drains once first if online.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.shutdown_tx.is_some() {
            return Err(SyncError::Internal("Sync agent already started".into()));
        }

        let pending = self.runtime.queue.len().await;
        info!(
            terminal_id = %self.config.terminal_id(),
            routing_mode = %self.config.routing_mode(),
            online = self.runtime.monitor.is_online(),
            pending,
            "Starting sync agent"
        );

        // Subscribe before the first drain so no transition is missed.
        let events = self.runtime.monitor.subscribe();
        let wake = self.runtime.engine.wake_handle();

        if self.runtime.monitor.is_online() {
            let outcome = self.runtime.drain(false).await;
            info!(?outcome, "Startup drain finished");
        } else {
            self.runtime.refresh(None).await;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.tasks.push(tokio::spawn(
            self.runtime.clone().run(events, wake, shutdown_rx),
        ));

        if let (Some(check), Some(interval)) = (self.reachability.clone(), self.config.check_interval()) {
            debug!(interval_secs = interval.as_secs(), "Starting reachability check");
            self.tasks
                .push(self.runtime.monitor.spawn_reachability_check(check, interval));
        }

        info!("Sync agent started");
        Ok(())
    }

    /// Stops the background loop and the check.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync agent");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.runtime.engine.cancel_retry().await;

        for task in self.tasks.drain(..) {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(error = %err, "Sync task failed");
                }
            }
        }

        info!("Sync agent stopped");
        Ok(())
    }

    /// "Sync now": a manual drain, which also re-sends a blocked head.
    pub async fn sync_now(&self) -> DrainOutcome {
        self.runtime.drain(true).await
    }

    /// Drops the blocked head operation. See [`SyncEngine::discard_blocked`].
    pub async fn discard_blocked(&self, sequence_id: u64) -> SyncResult<DeadLetter> {
        let letter = self.runtime.engine.discard_blocked(sequence_id).await?;
        self.runtime.refresh(None).await;
        Ok(letter)
    }

    pub async fn status(&self) -> SyncStatus {
        self.runtime.refresh(None).await
    }

    pub fn router(&self) -> Arc<CommandRouter> {
        self.router.clone()
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.runtime.engine.clone()
    }

    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        self.runtime.monitor.clone()
    }

    pub fn queue(&self) -> Arc<PendingQueue> {
        self.runtime.queue.clone()
    }

    pub fn entities(&self) -> Arc<EntityStore> {
        self.entities.clone()
    }

    /// A cloneable handle for hosts that do not own the agent.
    pub fn handle(&self) -> Option<SyncAgentHandle> {
        self.shutdown_tx.as_ref().map(|tx| SyncAgentHandle {
            shutdown_tx: tx.clone(),
            runtime: self.runtime.clone(),
        })
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running SyncAgent from outside.
#[derive(Clone)]
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    runtime: Arc<Runtime>,
}

impl SyncAgentHandle {
    pub async fn status(&self) -> SyncStatus {
        self.runtime.status.read().await.clone()
    }

    pub async fn sync_now(&self) -> DrainOutcome {
        self.runtime.drain(true).await
    }

    /// Signals the background loop to stop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    kv: Option<Arc<dyn KvStore>>,
    backend: Option<Arc<dyn Backend>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    reachability: Option<Arc<dyn ReachabilityCheck>>,
    initially_online: bool,
}

impl SyncAgentBuilder {
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            kv: None,
            backend: None,
            emitter: None,
            reachability: None,
            initially_online: false,
        }
    }

    /// Persistence to use instead of the configured SQLite file.
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn with_reachability_check(mut self, check: Arc<dyn ReachabilityCheck>) -> Self {
        self.reachability = Some(check);
        self
    }

    /// Raw reachability before the first check or host report.
    pub fn initially_online(mut self, online: bool) -> Self {
        self.initially_online = online;
        self
    }

    /// Loads persisted state and wires the components together.
    pub async fn build(self) -> SyncResult<SyncAgent> {
        self.config.validate()?;

        let backend = self
            .backend
            .ok_or_else(|| SyncError::InvalidConfig("Backend required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        let kv: Arc<dyn KvStore> = match self.kv {
            Some(kv) => kv,
            None => {
                let path = self.config.database_path().ok_or_else(|| {
                    SyncError::InvalidConfig("No database path configured".into())
                })?;
                Arc::new(Database::new(DbConfig::new(path)).await?) as Arc<dyn KvStore>
            }
        };

        let entities = Arc::new(EntityStore::load(kv.clone()).await?);
        let queue = Arc::new(PendingQueue::load(kv).await?);

        let monitor = Arc::new(ConnectivityMonitor::new(self.initially_online));
        if entities.snapshot().await.offline_mode {
            info!("Offline mode was left on, restoring");
            monitor.set_forced_offline(true);
        }

        let engine = Arc::new(SyncEngine::new(
            entities.clone(),
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            emitter.clone(),
            &self.config,
        ));
        let router = Arc::new(CommandRouter::new(
            entities.clone(),
            queue.clone(),
            backend,
            monitor.clone(),
            engine.clone(),
            &self.config,
        ));

        let status = SyncStatus {
            routing_mode: self.config.routing_mode(),
            ..Default::default()
        };
        let runtime = Arc::new(Runtime {
            queue,
            monitor,
            engine,
            emitter,
            status: Arc::new(RwLock::new(status)),
            retry_ceiling: self.config.sync.retry_ceiling,
        });

        Ok(SyncAgent {
            config: Arc::new(self.config),
            entities,
            router,
            runtime,
            reachability: self.reachability,
            shutdown_tx: None,
            tasks: Vec::new(),
        })
    }
}
