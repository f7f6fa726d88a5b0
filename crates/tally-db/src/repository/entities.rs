//! # Entity Store
//!
//! Owns the terminal's [`PosState`]: one lock for single-writer
//! serialization, one blob for durability.
//!
//! Callers mutate through an [`EntityGuard`]. The guard hands out a draft
//! copy; nothing becomes visible until `commit` has written the draft.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use tally_core::PosState;

use crate::error::DbResult;
use crate::kv::KvStore;

/// Key of the persisted entity snapshot.
pub const STATE_KEY: &str = "pos:state";

pub struct EntityStore {
    kv: Arc<dyn KvStore>,
    state: Mutex<PosState>,
}

impl EntityStore {
    /// Restores the last committed snapshot, or starts empty.
    pub async fn load(kv: Arc<dyn KvStore>) -> DbResult<Self> {
        let state = match kv.get(STATE_KEY).await? {
            Some(bytes) => {
                let state: PosState = serde_json::from_slice(&bytes)?;
                info!(
                    active_orders = state.active_orders.len(),
                    cart_lines = state.cart.len(),
                    "Restored entity snapshot"
                );
                state
            }
            None => {
                debug!("No entity snapshot, starting empty");
                PosState::default()
            }
        };

        Ok(EntityStore {
            kv,
            state: Mutex::new(state),
        })
    }

    /// Takes the entity lock. Hold it only for local work, never across a
    /// remote call.
    pub async fn lock(&self) -> EntityGuard<'_> {
        EntityGuard {
            kv: self.kv.as_ref(),
            state: self.state.lock().await,
        }
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> PosState {
        self.state.lock().await.clone()
    }
}

/// Exclusive access to the entity state.
pub struct EntityGuard<'a> {
    kv: &'a dyn KvStore,
    state: MutexGuard<'a, PosState>,
}

impl EntityGuard<'_> {
    pub fn state(&self) -> &PosState {
        &self.state
    }

    /// A copy to apply transitions to.
    pub fn draft(&self) -> PosState {
        self.state.clone()
    }

    /// Persists `next` and makes it current. On a storage error the
    /// current state is untouched.
    pub async fn commit(&mut self, next: PosState) -> DbResult<()> {
        let bytes = serde_json::to_vec(&next)?;
        self.kv.set(STATE_KEY, bytes).await?;
        *self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use tally_core::types::ProductSnapshot;

    #[tokio::test]
    async fn test_commit_persists_and_reloads() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = EntityStore::load(kv.clone()).await.unwrap();

        {
            let mut guard = store.lock().await;
            let mut draft = guard.draft();
            draft
                .cart
                .add(ProductSnapshot::new("p-1", "Soda", 250, 60), 2, vec![], None)
                .unwrap();
            draft.offline_mode = true;
            guard.commit(draft).await.unwrap();
        }

        let reloaded = EntityStore::load(kv).await.unwrap();
        let state = reloaded.snapshot().await;
        assert_eq!(state.cart.len(), 1);
        assert!(state.offline_mode);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_untouched() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = EntityStore::load(kv.clone()).await.unwrap();

        kv.set_fail_writes(true);
        let mut guard = store.lock().await;
        let mut draft = guard.draft();
        draft.offline_mode = true;

        assert!(guard.commit(draft).await.is_err());
        assert!(!guard.state().offline_mode);
    }
}
