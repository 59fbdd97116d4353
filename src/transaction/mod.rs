//! Coordinator-side transaction handles and the commit/rollback driver.

pub mod manager;
pub mod sweep;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::substrate::ProcStatus;
use crate::types::{CacheName, IsolationLevel, Key, PartitionSet, TransactionId};

pub use manager::TransactionManager;
pub use sweep::{MarkUnit, SweepKind};

/// What every transform needs to know about the transaction running it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    /// Single-key writes are stored already committed and never swept. Bulk
    /// writes are committed together when the call succeeds.
    pub auto_commit: bool,
}

impl TransactionMetadata {
    pub fn new(id: TransactionId, isolation: IsolationLevel, auto_commit: bool) -> Self {
        Self {
            id,
            isolation,
            auto_commit,
        }
    }
}

/// Lifecycle of a transaction as seen by its coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {0} already exists")]
    Duplicate(TransactionId),
    #[error("transaction {id} is {state:?}, not open")]
    NotOpen {
        id: TransactionId,
        state: TransactionState,
    },
    #[error("transaction {0} is rollback-only")]
    RollbackOnly(TransactionId),
    #[error("status of transaction {id} is {found:?}, expected {expected:?}")]
    StatusMismatch {
        id: TransactionId,
        expected: ProcStatus,
        found: ProcStatus,
    },
    #[error("transaction {0} has no status record")]
    MissingStatus(TransactionId),
    #[error("sweep of transaction {id} failed: {reason}")]
    SweepFailed { id: TransactionId, reason: String },
}

/// Handle owned by the code running a transaction.
///
/// Tracks everything the transaction changed so commit and rollback know what
/// to sweep. Each accumulator sits behind its own lock so concurrent bulk
/// operations of one transaction can record in parallel.
#[derive(Debug)]
pub struct Transaction {
    meta: TransactionMetadata,
    rollback_only: AtomicBool,
    state: Mutex<TransactionState>,
    affected_keys: Mutex<BTreeMap<CacheName, BTreeSet<Key>>>,
    affected_partitions: Mutex<BTreeMap<CacheName, PartitionSet>>,
}

impl Transaction {
    pub(crate) fn new(meta: TransactionMetadata) -> Self {
        Self {
            meta,
            rollback_only: AtomicBool::new(false),
            state: Mutex::new(TransactionState::Open),
            affected_keys: Mutex::new(BTreeMap::new()),
            affected_partitions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn metadata(&self) -> TransactionMetadata {
        self.meta
    }

    pub fn id(&self) -> TransactionId {
        self.meta.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.meta.isolation
    }

    pub fn auto_commit(&self) -> bool {
        self.meta.auto_commit
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// After this only rollback is accepted.
    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub async fn state(&self) -> TransactionState {
        *self.state.lock().await
    }

    pub async fn affected_keys(&self) -> BTreeMap<CacheName, BTreeSet<Key>> {
        self.affected_keys.lock().await.clone()
    }

    pub async fn affected_partitions(&self) -> BTreeMap<CacheName, PartitionSet> {
        self.affected_partitions.lock().await.clone()
    }

    pub(crate) async fn add_keys<I>(&self, cache: &str, keys: I)
    where
        I: IntoIterator<Item = Key>,
    {
        let mut affected = self.affected_keys.lock().await;
        affected.entry(cache.to_string()).or_default().extend(keys);
    }

    pub(crate) async fn add_partitions(&self, cache: &str, partitions: &PartitionSet) {
        let mut affected = self.affected_partitions.lock().await;
        affected
            .entry(cache.to_string())
            .or_default()
            .union_with(partitions);
    }

    pub(crate) async fn ensure_open(&self) -> Result<(), TransactionError> {
        let state = *self.state.lock().await;
        if state != TransactionState::Open {
            return Err(TransactionError::NotOpen {
                id: self.meta.id,
                state,
            });
        }
        Ok(())
    }

    pub(crate) async fn set_state(&self, state: TransactionState) {
        *self.state.lock().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Transaction {
        Transaction::new(TransactionMetadata::new(
            TransactionId::new(3, 0, 1),
            IsolationLevel::Serializable,
            false,
        ))
    }

    #[tokio::test]
    async fn accumulates_keys_and_partitions_per_cache() {
        let txn = handle();
        txn.add_keys("a", ["x".to_string(), "y".to_string()]).await;
        txn.add_keys("a", ["x".to_string()]).await;
        txn.add_partitions("b", &[1, 2].into_iter().collect()).await;
        txn.add_partitions("b", &[2, 5].into_iter().collect()).await;

        assert_eq!(txn.affected_keys().await["a"].len(), 2);
        let partitions: Vec<_> = txn.affected_partitions().await["b"].iter().collect();
        assert_eq!(partitions, vec![1, 2, 5]);
    }

    #[tokio::test]
    async fn state_and_rollback_only_flags() {
        let txn = handle();
        assert!(txn.ensure_open().await.is_ok());
        assert!(!txn.is_rollback_only());
        txn.set_rollback_only();
        assert!(txn.is_rollback_only());
        txn.set_state(TransactionState::RolledBack).await;
        assert_eq!(
            txn.ensure_open().await,
            Err(TransactionError::NotOpen {
                id: txn.id(),
                state: TransactionState::RolledBack,
            })
        );
    }
}
