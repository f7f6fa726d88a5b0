//! # tally-sync: Offline Sync Runtime for Tally POS
//!
//! Keeps the terminal usable while the backend is unreachable and replays
//! what happened once it comes back.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Runtime Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (Orchestrator)                    │  │
//! │  │                                                                  │  │
//! │  │  Loads persisted state, drains at start, reacts to transitions   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ CommandRouter  │  │  SyncEngine    │  │ ConnectivityMonitor    │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Local, direct  │  │ FIFO replay,   │  │ Debounced online /     │    │
//! │  │ or queued      │  │ id remapping,  │  │ offline transitions,   │    │
//! │  │ commands       │  │ backoff        │  │ offline-mode toggle    │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  tally-db: EntityStore (pos:state) + PendingQueue (pos:...ops)  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                               │                                         │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Backend trait  (SimulatedBackend for drills and tests)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Main `SyncAgent` orchestrator and status events
//! - [`backend`] - Backend trait, dispatch and reconciliation
//! - [`config`] - Sync configuration (terminal, timeouts, backoff)
//! - [`connectivity`] - Online/offline tracking and checks
//! - [`engine`] - Queue drain loop
//! - [`error`] - Sync error types
//! - [`router`] - Terminal command entry points
//! - [`simulated`] - In-process backend of record
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{SimulatedBackend, SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let mut agent = SyncAgent::builder(config)
//!     .with_backend(Arc::new(SimulatedBackend::new()))
//!     .build()
//!     .await?;
//! agent.start().await?;
//!
//! let router = agent.router();
//! router.start_session(10_000).await?;
//!
//! let status = agent.status().await;
//! println!("Pending: {}", status.pending_count);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod backend;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod router;
pub mod simulated;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{NoOpEmitter, SyncAgent, SyncAgentBuilder, SyncAgentHandle, SyncEventEmitter, SyncStatus};
pub use backend::{Backend, BackendError, Confirmation, PaymentReceipt, RemoteOrder, RemoteSession};
pub use config::{RoutingMode, SyncConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ReachabilityCheck};
pub use engine::{Attention, AttentionKind, DrainOutcome, EngineState, StallReason, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use router::{CommandOutcome, CommandRouter, OpenedSession, PlacedOrder, RecordedPayment};
pub use simulated::{BackendCall, RemoteSnapshot, SimulatedBackend};
