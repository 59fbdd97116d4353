use thiserror::Error;

use crate::mvcc::FutureReadConflict;
use crate::processor::ProcessorError;
use crate::substrate::SubstrateError;
use crate::transaction::TransactionError;
use crate::types::{Key, TransactionId};

/// Errors returned by every public MVCC operation.
///
/// Waiting on uncommitted versions is not an error and never shows up here.
#[derive(Debug, Error)]
pub enum MvccError {
    /// The write would invalidate a read already served at a later id.
    /// Retrying with the same transaction fails the same way.
    #[error("write of key {key:?} by {writer} conflicts with the read at {reader}")]
    FutureRead {
        key: Key,
        writer: TransactionId,
        reader: TransactionId,
    },
    #[error("transaction {0} is read-prohibited")]
    ReadProhibited(TransactionId),
    #[error("transaction {0} was expired while waiting for another commit")]
    TransactionExpired(TransactionId),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("entry processor failed: {0}")]
    Processor(#[from] ProcessorError),
    #[error("operation could not reach a live owner: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Substrate(SubstrateError),
}

impl MvccError {
    /// Whether the failure is a lost delivery that re-dispatching can fix.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, MvccError::Substrate(err) if err.is_delivery_failure())
    }
}

impl From<SubstrateError> for MvccError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::NoOwner(partition) => {
                MvccError::Unavailable(format!("partition {partition} has no live owner"))
            }
            other => MvccError::Substrate(other),
        }
    }
}

impl From<FutureReadConflict<Key>> for MvccError {
    fn from(conflict: FutureReadConflict<Key>) -> Self {
        MvccError::FutureRead {
            key: conflict.key,
            writer: conflict.writer,
            reader: conflict.reader,
        }
    }
}

pub type Result<T, E = MvccError> = std::result::Result<T, E>;
