//! # Key-Value Seam
//!
//! The only storage contract the repositories rely on: whole blobs in,
//! whole blobs out. A `set` either lands completely or fails.
//!
//! Implementations:
//! - [`MemoryKvStore`] - process memory, with write-failure injection
//! - [`crate::Database`] - SQLite `kv_store` table

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{DbError, DbResult};

/// Durable key-value blob storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> DbResult<()>;

    async fn remove(&self, key: &str) -> DbResult<()>;
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process `KvStore`.
///
/// Survives as long as the value does, so sharing one `Arc<MemoryKvStore>`
/// between two agent instances simulates a restart.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set`/`remove` fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self, key: &str) -> DbResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            warn!(key, "Injected storage failure");
            return Err(DbError::WriteFailed {
                key: key.to_string(),
                reason: "storage unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> DbResult<()> {
        self.check_writable(key)?;
        self.entries.lock().await.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> DbResult<()> {
        self.check_writable(key)?;
        self.entries.lock().await.remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let kv = MemoryKvStore::new();
        kv.set("a", b"one".to_vec()).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(b"one".to_vec()));

        kv.remove("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure_keeps_old_value() {
        let kv = MemoryKvStore::new();
        kv.set("a", b"one".to_vec()).await.unwrap();

        kv.set_fail_writes(true);
        assert!(kv.set("a", b"two".to_vec()).await.is_err());
        assert_eq!(kv.get("a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(kv.write_count(), 1);
    }
}
