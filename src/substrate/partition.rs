use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::mvcc::MvccStore;
use crate::types::{CacheName, Key, TransactionId, Value};

use super::feed::ChangeEvent;

/// Durable processing status of a transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcStatus {
    Open,
    Committing,
    RollingBack,
}

/// The only durably stored transaction state, keyed by transaction id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxnStatusRecord {
    pub proc_status: ProcStatus,
    pub started_at_millis: u64,
}

impl TxnStatusRecord {
    pub fn open(started_at_millis: u64) -> Self {
        Self {
            proc_status: ProcStatus::Open,
            started_at_millis,
        }
    }
}

/// Everything one partition holds: per-cache version stores plus the status
/// records of the transactions whose ids hash to it.
///
/// Transforms mutate it in place and queue [`ChangeEvent`]s; the substrate
/// publishes queued events once the transform has finished.
#[derive(Debug, Default)]
pub struct PartitionData {
    caches: HashMap<CacheName, MvccStore<Key, Value>>,
    statuses: HashMap<TransactionId, TxnStatusRecord>,
    pending_events: Vec<ChangeEvent>,
}

impl PartitionData {
    pub fn cache(&self, name: &str) -> Option<&MvccStore<Key, Value>> {
        self.caches.get(name)
    }

    pub fn cache_mut(&mut self, name: &str) -> &mut MvccStore<Key, Value> {
        self.caches.entry(name.to_string()).or_default()
    }

    pub fn status(&self, id: &TransactionId) -> Option<&TxnStatusRecord> {
        self.statuses.get(id)
    }

    /// Conditional insert: returns `false` if a record already exists.
    pub fn insert_status(&mut self, id: TransactionId, record: TxnStatusRecord) -> bool {
        if self.statuses.contains_key(&id) {
            return false;
        }
        self.statuses.insert(id, record);
        self.emit(ChangeEvent::StatusChanged {
            id,
            status: Some(record.proc_status),
        });
        true
    }

    pub fn set_status(&mut self, id: TransactionId, status: ProcStatus) -> bool {
        let Some(record) = self.statuses.get_mut(&id) else {
            return false;
        };
        record.proc_status = status;
        self.emit(ChangeEvent::StatusChanged {
            id,
            status: Some(status),
        });
        true
    }

    pub fn remove_status(&mut self, id: &TransactionId) -> Option<TxnStatusRecord> {
        let removed = self.statuses.remove(id);
        if removed.is_some() {
            self.emit(ChangeEvent::StatusChanged {
                id: *id,
                status: None,
            });
        }
        removed
    }

    pub fn statuses(&self) -> impl Iterator<Item = (&TransactionId, &TxnStatusRecord)> {
        self.statuses.iter()
    }

    pub fn emit(&mut self, event: ChangeEvent) {
        self.pending_events.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.pending_events)
    }
}
