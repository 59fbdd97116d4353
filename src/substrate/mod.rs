//! Boundary to the partitioned key-value store underneath the MVCC layer.
//!
//! The MVCC core only needs what [`Substrate`] describes: atomic transforms per
//! partition on the owning node, ownership lookups, liveness, and change
//! notification. [`LocalCluster`] implements it in process with simulated
//! nodes so the protocol can run and be tested without a real grid.

pub mod feed;
pub mod local;
pub mod partition;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Key, NodeId, PartitionId, PartitionSet, TransactionId, partition_of};

pub use feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeListener, ListenerEvent};
pub use local::LocalCluster;
pub use partition::{PartitionData, ProcStatus, TxnStatusRecord};

/// Errors surfaced by substrate implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("node {0} left the cluster")]
    NodeLeft(NodeId),
    #[error("node {node} no longer owns partition {partition}")]
    NotOwner {
        node: NodeId,
        partition: PartitionId,
    },
    #[error("partition {0} has no live owner")]
    NoOwner(PartitionId),
    #[error("partition {0} does not exist")]
    UnknownPartition(PartitionId),
    #[error("node {0} is not a cluster member")]
    UnknownNode(NodeId),
}

impl SubstrateError {
    /// Delivery failures that are resolved by re-resolving ownership and
    /// sending the work again.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            SubstrateError::NodeLeft(_) | SubstrateError::NotOwner { .. }
        )
    }
}

/// Abstract capabilities of the partitioned store.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    fn partition_count(&self) -> u32;

    fn partition_for_key(&self, key: &Key) -> PartitionId {
        partition_of(key, self.partition_count())
    }

    /// Partition holding the status record of `id`.
    fn partition_for_txn(&self, id: &TransactionId) -> PartitionId {
        partition_of(id, self.partition_count())
    }

    async fn owner_of(&self, partition: PartitionId) -> Option<NodeId>;

    async fn is_alive(&self, node: NodeId) -> bool;

    async fn live_nodes(&self) -> Vec<NodeId>;

    /// Split `partitions` by current live owner. Fails if any partition has
    /// no live owner.
    async fn owners(
        &self,
        partitions: &PartitionSet,
    ) -> Result<BTreeMap<NodeId, PartitionSet>, SubstrateError> {
        let mut split: BTreeMap<NodeId, PartitionSet> = BTreeMap::new();
        for partition in partitions.iter() {
            let owner = self
                .owner_of(partition)
                .await
                .ok_or(SubstrateError::NoOwner(partition))?;
            split.entry(owner).or_default().insert(partition);
        }
        Ok(split)
    }

    /// Run `f` atomically against `partition` on whichever node owns it now.
    async fn transform<F, R>(&self, partition: PartitionId, f: F) -> Result<R, SubstrateError>
    where
        F: FnOnce(&mut PartitionData) -> R + Send,
        R: Send;

    /// Run `f` atomically against `partition` on `node`, failing with a
    /// delivery error if `node` is gone or no longer owns the partition.
    async fn transform_on<F, R>(
        &self,
        node: NodeId,
        partition: PartitionId,
        f: F,
    ) -> Result<R, SubstrateError>
    where
        F: FnOnce(&mut PartitionData) -> R + Send,
        R: Send;

    /// Register interest in changes of one entry.
    fn subscribe(&self, filter: ChangeFilter) -> ChangeListener;
}
