//! # tally-core: Pure Domain Model for the Tally POS Sync Engine
//!
//! Everything the terminal knows about carts, orders, tables and sessions,
//! plus the payloads it records while the backend is unreachable. No I/O
//! lives here: persistence is `tally-db`, remote calls are `tally-sync`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Tally POS Sync Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 CommandRouter (tally-sync)                      │   │
//! │  │   add_to_cart, create_order, process_payment, start_session    │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   cart    │  │ operation │  │   state   │  │   │
//! │  │   │  Order    │  │   Cart    │  │  Payloads │  │ PosState  │  │   │
//! │  │   │  Table    │  │ CartItem  │  │  IdRemap  │  │ transitions│ │   │
//! │  │   │  Session  │  │           │  │           │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │           tally-db (EntityStore, PendingQueue, KvStore)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities (orders, tables, sessions, customers)
//! - [`cart`] - The in-progress cart and its line merging rules
//! - [`ids`] - Placeholder, held-order and token generation
//! - [`operation`] - Queued operation payloads and identifier rewriting
//! - [`state`] - `PosState` and its pure transitions
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::cart::Cart;
//! use tally_core::types::ProductSnapshot;
//!
//! let coffee = ProductSnapshot::new("p-1", "Flat White", 450, 120);
//!
//! let mut cart = Cart::default();
//! cart.add(coffee.clone(), 1, vec![], None).unwrap();
//! cart.add(coffee, 2, vec![], None).unwrap();
//!
//! // Same product, modifiers and notes: one merged line.
//! assert_eq!(cart.len(), 1);
//! assert_eq!(cart.total_cents(), 1350);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cart;
pub mod error;
pub mod ids;
pub mod operation;
pub mod state;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cart::{Cart, CartItem};
pub use error::{CoreError, CoreResult, ValidationError};
pub use operation::{
    DeadLetter, DeadLetterReason, IdRemap, Operation, OperationKind, PendingOperation,
};
pub use state::{PosState, StatusChange};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum distinct lines allowed in a single cart.
pub const MAX_CART_ITEMS: usize = 100;

/// Maximum quantity of a single cart line.
///
/// ## Business Reason
/// Catches typing 1000 instead of 10 before it reaches an order.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Tax profile attached to every order line the terminal submits.
pub const DEFAULT_TAX_PROFILE: i64 = 1;
