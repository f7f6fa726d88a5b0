//! # Repository Module
//!
//! The two durable repositories of the sync engine.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EntityStore                        PendingQueue                       │
//! │  ├── lock() → EntityGuard           ├── enqueue / enqueue_batch        │
//! │  │   ├── draft()                    ├── drain / head                   │
//! │  │   └── commit(next)               ├── confirm (rewrite + ack)        │
//! │  └── snapshot()                     ├── record_failure                 │
//! │                                     ├── dead_letter / retract          │
//! │                                     └── peek_failures                  │
//! │            │                                  │                         │
//! │            └──────────────┬───────────────────┘                         │
//! │                           ▼                                             │
//! │                  Arc<dyn KvStore>                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both repositories follow the same write rule: build the next value,
//! write it durably, and only then swap it into memory.

pub mod entities;
pub mod pending;
