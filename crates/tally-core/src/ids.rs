//! # Identifier Generation
//!
//! Ids the terminal mints on its own, without asking the backend.
//!
//! ```text
//! local-<uuid>   placeholder for a backend-issued order/session id
//! hold-<uuid>    parked order, never sent to the backend
//! <uuid>         idempotency token for payments and sessions
//! TXN-<millis>-<hex8>   client-side payment reference
//! ```

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const PLACEHOLDER_PREFIX: &str = "local-";
pub const HELD_PREFIX: &str = "hold-";

/// Mints a placeholder id for an order or session created locally.
pub fn new_placeholder() -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4())
}

/// Mints an id for a held (parked) order.
pub fn new_held_id() -> String {
    format!("{}{}", HELD_PREFIX, Uuid::new_v4())
}

/// Mints an idempotency token.
///
/// The token is generated once per command and travels unchanged through
/// every retry of the same operation.
pub fn new_idempotency_key() -> String {
    Uuid::new_v4().to_string()
}

/// Builds the client-side payment reference from the command time.
///
/// A random suffix keeps two payments taken in the same millisecond apart.
pub fn client_transaction_ref(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("TXN-{}-{}", at.timestamp_millis(), &suffix[..8])
}

pub fn is_placeholder(id: &str) -> bool {
    id.starts_with(PLACEHOLDER_PREFIX)
}

pub fn is_held(id: &str) -> bool {
    id.starts_with(HELD_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_classification() {
        let local = new_placeholder();
        assert!(is_placeholder(&local));
        assert!(!is_held(&local));

        let held = new_held_id();
        assert!(is_held(&held));
        assert!(!is_placeholder(&held));

        assert!(!is_placeholder("R1"));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_idempotency_key(), new_idempotency_key());
    }

    #[test]
    fn test_transaction_refs_differ_within_one_millisecond() {
        let at = Utc::now();
        let first = client_transaction_ref(at);
        let second = client_transaction_ref(at);

        assert_ne!(first, second);
        assert!(first.starts_with(&format!("TXN-{}-", at.timestamp_millis())));
    }
}
