//! # Pending-Operation Queue
//!
//! Durable FIFO of intents waiting for the backend.
//!
//! ## Write Discipline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   lock log ──► clone ──► mutate clone ──► kv.set(QUEUE_KEY) ──► swap   │
//! │                                                 │                       │
//! │                                                 └── Err: log unchanged │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `confirm` rewrites later operations and removes the confirmed one in a
//! single write, so a crash can never persist one half of it.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tally_core::{DeadLetter, DeadLetterReason, IdRemap, Operation, PendingOperation};

use crate::error::{DbError, DbResult};
use crate::kv::KvStore;

/// Key of the persisted queue.
pub const QUEUE_KEY: &str = "pos:pending_operations";

/// Oldest dead letters are dropped past this many.
pub const MAX_DEAD_LETTERS: usize = 500;

/// Persisted shape of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueLog {
    next_sequence: u64,
    #[serde(default)]
    operations: Vec<PendingOperation>,
    #[serde(default)]
    dead_letters: Vec<DeadLetter>,
}

impl Default for QueueLog {
    fn default() -> Self {
        QueueLog {
            next_sequence: 1,
            operations: Vec::new(),
            dead_letters: Vec::new(),
        }
    }
}

impl QueueLog {
    fn push_dead_letter(&mut self, letter: DeadLetter) {
        self.dead_letters.push(letter);
        if self.dead_letters.len() > MAX_DEAD_LETTERS {
            let excess = self.dead_letters.len() - MAX_DEAD_LETTERS;
            self.dead_letters.drain(..excess);
        }
    }

    fn position(&self, sequence_id: u64) -> DbResult<usize> {
        self.operations
            .iter()
            .position(|op| op.sequence_id == sequence_id)
            .ok_or_else(|| DbError::not_found("pending operation", sequence_id.to_string()))
    }
}

pub struct PendingQueue {
    kv: Arc<dyn KvStore>,
    log: Mutex<QueueLog>,
}

impl PendingQueue {
    /// Restores the persisted queue, or starts empty at sequence 1.
    pub async fn load(kv: Arc<dyn KvStore>) -> DbResult<Self> {
        let mut log = match kv.get(QUEUE_KEY).await? {
            Some(bytes) => serde_json::from_slice::<QueueLog>(&bytes)?,
            None => QueueLog::default(),
        };

        log.operations.sort_by_key(|op| op.sequence_id);
        let floor = log
            .operations
            .last()
            .map(|op| op.sequence_id + 1)
            .unwrap_or(1);
        if log.next_sequence < floor {
            warn!(
                stored = log.next_sequence,
                floor, "Queue counter behind its entries, advancing"
            );
            log.next_sequence = floor;
        }

        info!(
            pending = log.operations.len(),
            dead_letters = log.dead_letters.len(),
            next_sequence = log.next_sequence,
            "Pending queue loaded"
        );

        Ok(PendingQueue {
            kv,
            log: Mutex::new(log),
        })
    }

    async fn persist(&self, log: &QueueLog) -> DbResult<()> {
        let bytes = serde_json::to_vec(log)?;
        self.kv.set(QUEUE_KEY, bytes).await
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    pub async fn enqueue(&self, operation: Operation) -> DbResult<PendingOperation> {
        let mut entries = self.enqueue_batch(vec![operation]).await?;
        entries
            .pop()
            .ok_or_else(|| DbError::Internal("enqueue produced no entry".to_string()))
    }

    /// Appends all operations with consecutive sequence ids in one write.
    pub async fn enqueue_batch(&self, operations: Vec<Operation>) -> DbResult<Vec<PendingOperation>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let mut log = self.log.lock().await;
        let mut next = log.clone();
        let now = Utc::now();

        let mut added = Vec::with_capacity(operations.len());
        for operation in operations {
            let entry = PendingOperation {
                sequence_id: next.next_sequence,
                operation,
                enqueued_at: now,
                attempts: 0,
                last_error: None,
                last_attempt_at: None,
            };
            next.next_sequence += 1;
            next.operations.push(entry.clone());
            added.push(entry);
        }

        self.persist(&next).await?;
        *log = next;

        for entry in &added {
            debug!(
                sequence_id = entry.sequence_id,
                kind = %entry.kind(),
                subject = entry.operation.subject(),
                "Operation enqueued"
            );
        }
        Ok(added)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All pending operations in sequence order. Does not touch attempts.
    pub async fn drain(&self) -> Vec<PendingOperation> {
        self.log.lock().await.operations.clone()
    }

    pub async fn head(&self) -> Option<PendingOperation> {
        self.log.lock().await.operations.first().cloned()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.operations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.operations.is_empty()
    }

    /// Operations that failed more than `ceiling` times.
    pub async fn peek_failures(&self, ceiling: u32) -> Vec<PendingOperation> {
        self.log
            .lock()
            .await
            .operations
            .iter()
            .filter(|op| op.attempts > ceiling)
            .cloned()
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.log.lock().await.dead_letters.clone()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Removes a confirmed operation.
    pub async fn acknowledge(&self, sequence_id: u64) -> DbResult<()> {
        self.confirm(sequence_id, None).await.map(|_| ())
    }

    /// Removes a confirmed operation and applies its identifier remap to
    /// every operation behind it.
    ///
    /// ## Returns
    /// Number of operations rewritten.
    pub async fn confirm(&self, sequence_id: u64, remap: Option<&IdRemap>) -> DbResult<usize> {
        let mut log = self.log.lock().await;
        let mut next = log.clone();

        let index = next.position(sequence_id)?;
        next.operations.remove(index);

        let mut rewritten = 0;
        if let Some(remap) = remap {
            for entry in next
                .operations
                .iter_mut()
                .filter(|op| op.sequence_id > sequence_id)
            {
                if entry.operation.rewrite(remap) {
                    rewritten += 1;
                }
            }
        }

        self.persist(&next).await?;
        *log = next;

        debug!(sequence_id, rewritten, "Operation confirmed");
        Ok(rewritten)
    }

    /// Counts one failed remote call.
    ///
    /// ## Returns
    /// The new attempt count.
    pub async fn record_failure(&self, sequence_id: u64, error: &str) -> DbResult<u32> {
        let mut log = self.log.lock().await;
        let mut next = log.clone();

        let index = next.position(sequence_id)?;
        let entry = &mut next.operations[index];
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.last_attempt_at = Some(Utc::now());
        let attempts = entry.attempts;

        self.persist(&next).await?;
        *log = next;

        Ok(attempts)
    }

    /// Moves an operation out of the queue into the dead-letter list.
    pub async fn dead_letter(
        &self,
        sequence_id: u64,
        reason: DeadLetterReason,
        detail: impl Into<String>,
    ) -> DbResult<DeadLetter> {
        let mut log = self.log.lock().await;
        let mut next = log.clone();

        let index = next.position(sequence_id)?;
        let entry = next.operations.remove(index);
        let letter = DeadLetter {
            entry,
            reason,
            detail: detail.into(),
            removed_at: Utc::now(),
        };
        next.push_dead_letter(letter.clone());

        self.persist(&next).await?;
        *log = next;

        warn!(
            sequence_id,
            kind = %letter.entry.kind(),
            %reason,
            detail = %letter.detail,
            "Operation moved to dead letters"
        );
        Ok(letter)
    }

    /// Records an operation the backend rejected before it was ever queued.
    ///
    /// The entry takes the next sequence id, so the dead-letter log stays
    /// ordered with queued work.
    pub async fn record_rejected(
        &self,
        operation: Operation,
        detail: impl Into<String>,
    ) -> DbResult<DeadLetter> {
        let mut log = self.log.lock().await;
        let mut next = log.clone();
        let now = Utc::now();
        let detail = detail.into();

        let entry = PendingOperation {
            sequence_id: next.next_sequence,
            operation,
            enqueued_at: now,
            attempts: 1,
            last_error: Some(detail.clone()),
            last_attempt_at: Some(now),
        };
        next.next_sequence += 1;
        let letter = DeadLetter {
            entry,
            reason: DeadLetterReason::Rejected,
            detail,
            removed_at: now,
        };
        next.push_dead_letter(letter.clone());

        self.persist(&next).await?;
        *log = next;

        warn!(
            sequence_id = letter.entry.sequence_id,
            kind = %letter.entry.kind(),
            detail = %letter.detail,
            "Rejected operation recorded in dead letters"
        );
        Ok(letter)
    }

    /// Removes operations enqueued by a command whose entity write then
    /// failed. Their sequence ids are not reused.
    pub async fn retract(&self, sequence_ids: &[u64]) -> DbResult<()> {
        if sequence_ids.is_empty() {
            return Ok(());
        }

        let mut log = self.log.lock().await;
        let mut next = log.clone();
        next.operations
            .retain(|op| !sequence_ids.contains(&op.sequence_id));

        self.persist(&next).await?;
        *log = next;

        debug!(?sequence_ids, "Operations retracted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use tally_core::operation::{
        CreateOrderPayload, ProcessPaymentPayload, UpdateOrderStatusPayload,
        UpdateTableStatusPayload,
    };
    use tally_core::types::{OrderStatus, PaymentMethod, TableStatus};

    fn create_order(reference: &str) -> Operation {
        Operation::CreateOrder(CreateOrderPayload {
            client_reference: reference.to_string(),
            session_id: "S1".to_string(),
            items: vec![],
            customer_id: None,
            table_id: None,
            employee_id: None,
        })
    }

    fn complete(order_id: &str) -> Operation {
        Operation::UpdateOrderStatus(UpdateOrderStatusPayload {
            order_id: order_id.to_string(),
            status: OrderStatus::Completed,
        })
    }

    fn pay(order_id: &str) -> Operation {
        Operation::ProcessPayment(ProcessPaymentPayload {
            order_id: order_id.to_string(),
            session_id: "S1".to_string(),
            method: PaymentMethod::Card,
            amount_cents: 900,
            tip_cents: 100,
            transaction_ref: "TXN-1".to_string(),
            idempotency_key: "tok-1".to_string(),
        })
    }

    fn free_table(table_id: &str) -> Operation {
        Operation::UpdateTableStatus(UpdateTableStatusPayload {
            table_id: table_id.to_string(),
            status: TableStatus::Available,
        })
    }

    #[tokio::test]
    async fn test_sequence_ids_increase_across_reload() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv.clone()).await.unwrap();

        let first = queue.enqueue(free_table("T1")).await.unwrap();
        let second = queue.enqueue(free_table("T2")).await.unwrap();
        assert_eq!((first.sequence_id, second.sequence_id), (1, 2));

        queue.acknowledge(2).await.unwrap();

        let reloaded = PendingQueue::load(kv).await.unwrap();
        let third = reloaded.enqueue(free_table("T3")).await.unwrap();
        assert_eq!(third.sequence_id, 3);

        let ids: Vec<u64> = reloaded.drain().await.iter().map(|op| op.sequence_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_queue_unchanged() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv.clone()).await.unwrap();
        queue.enqueue(free_table("T1")).await.unwrap();

        kv.set_fail_writes(true);
        assert!(queue
            .enqueue_batch(vec![create_order("local-a"), complete("local-a")])
            .await
            .is_err());
        assert_eq!(queue.len().await, 1);

        kv.set_fail_writes(false);
        let next = queue.enqueue(free_table("T2")).await.unwrap();
        assert_eq!(next.sequence_id, 2);
    }

    #[tokio::test]
    async fn test_confirm_rewrites_and_removes_in_one_write() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv.clone()).await.unwrap();
        queue
            .enqueue_batch(vec![
                create_order("local-a"),
                complete("local-a"),
                pay("local-a"),
                complete("local-b"),
            ])
            .await
            .unwrap();

        let writes_before = kv.write_count();
        let remap = IdRemap::Order {
            placeholder: "local-a".to_string(),
            remote_id: "R1".to_string(),
        };
        let rewritten = queue.confirm(1, Some(&remap)).await.unwrap();

        assert_eq!(rewritten, 2);
        assert_eq!(kv.write_count(), writes_before + 1);

        let remaining: Vec<String> = queue
            .drain()
            .await
            .iter()
            .map(|op| op.operation.subject().to_string())
            .collect();
        assert_eq!(remaining, vec!["R1", "R1", "local-b"]);

        let reloaded = PendingQueue::load(kv).await.unwrap();
        assert_eq!(reloaded.head().await.unwrap().operation, complete("R1"));
    }

    #[tokio::test]
    async fn test_attempts_only_change_on_recorded_failure() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv).await.unwrap();
        queue.enqueue(free_table("T1")).await.unwrap();

        queue.drain().await;
        queue.head().await;
        assert_eq!(queue.head().await.unwrap().attempts, 0);

        assert_eq!(queue.record_failure(1, "timeout").await.unwrap(), 1);
        assert_eq!(queue.record_failure(1, "unavailable").await.unwrap(), 2);

        let head = queue.head().await.unwrap();
        assert_eq!(head.attempts, 2);
        assert_eq!(head.last_error.as_deref(), Some("unavailable"));
        assert!(head.last_attempt_at.is_some());

        assert_eq!(queue.peek_failures(1).await.len(), 1);
        assert!(queue.peek_failures(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_removes_from_queue() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv).await.unwrap();
        queue
            .enqueue_batch(vec![pay("R9"), free_table("T1")])
            .await
            .unwrap();

        let letter = queue
            .dead_letter(1, DeadLetterReason::Rejected, "card declined")
            .await
            .unwrap();

        assert_eq!(letter.entry.sequence_id, 1);
        assert_eq!(queue.head().await.unwrap().sequence_id, 2);
        assert_eq!(queue.dead_letters().await.len(), 1);
        assert!(queue
            .dead_letter(1, DeadLetterReason::Discarded, "again")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rejected_before_queueing_lands_in_dead_letters() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv.clone()).await.unwrap();
        queue.enqueue(free_table("T1")).await.unwrap();

        let letter = queue
            .record_rejected(free_table("T4"), "table retired")
            .await
            .unwrap();

        assert_eq!(letter.entry.sequence_id, 2);
        assert_eq!(letter.reason, DeadLetterReason::Rejected);
        assert_eq!(letter.entry.attempts, 1);
        assert_eq!(queue.len().await, 1);

        let reloaded = PendingQueue::load(kv).await.unwrap();
        assert_eq!(reloaded.dead_letters().await, vec![letter]);
        assert_eq!(reloaded.enqueue(free_table("T2")).await.unwrap().sequence_id, 3);
    }

    #[tokio::test]
    async fn test_retract_does_not_reuse_sequence_ids() {
        let kv = Arc::new(MemoryKvStore::new());
        let queue = PendingQueue::load(kv).await.unwrap();
        let added = queue
            .enqueue_batch(vec![create_order("local-a"), free_table("T1")])
            .await
            .unwrap();
        let ids: Vec<u64> = added.iter().map(|op| op.sequence_id).collect();

        queue.retract(&ids).await.unwrap();
        assert!(queue.is_empty().await);

        let next = queue.enqueue(free_table("T2")).await.unwrap();
        assert_eq!(next.sequence_id, 3);
    }
}
