//! # tally-db: Persistence Layer for the Tally POS Sync Engine
//!
//! Everything that must survive a restart goes through this crate.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Data Flow                              │
//! │                                                                         │
//! │  CommandRouter / SyncEngine (tally-sync)                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  EntityStore  │    │ PendingQueue  │    │   KvStore    │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ Mutex<State>  │    │ Mutex<Log>    │    │ get/set/rm   │  │   │
//! │  │   │ "pos:state"   │───►│ "pos:pending_ │───►│ SQLite or    │  │   │
//! │  │   │               │    │  operations"  │    │ memory       │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   Lock order: EntityStore before PendingQueue, always.         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │             SQLite (kv_store table, WAL mode)                   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`kv`] - The `KvStore` seam and the in-memory implementation
//! - [`pool`] - SQLite-backed `KvStore` (connection pool + config)
//! - [`migrations`] - Embedded database migrations
//! - [`repository`] - `EntityStore` and `PendingQueue`
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_db::{Database, DbConfig, EntityStore, PendingQueue};
//!
//! let db = Arc::new(Database::new(DbConfig::new("./tally.db")).await?);
//! let entities = EntityStore::load(db.clone()).await?;
//! let queue = PendingQueue::load(db.clone()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod kv;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use kv::{KvStore, MemoryKvStore};
pub use pool::{Database, DbConfig};

pub use repository::entities::{EntityGuard, EntityStore, STATE_KEY};
pub use repository::pending::{PendingQueue, QUEUE_KEY};
