use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::types::{NodeId, PartitionId, PartitionSet};

use super::feed::{ChangeFeed, ChangeFilter, ChangeListener};
use super::partition::PartitionData;
use super::{Substrate, SubstrateError};

#[derive(Debug, Default)]
struct Membership {
    alive: BTreeMap<NodeId, bool>,
    owners: Vec<Option<NodeId>>,
}

impl Membership {
    fn live_owner(&self, partition: PartitionId) -> Option<NodeId> {
        let owner = self.owners.get(partition as usize).copied().flatten()?;
        self.alive.get(&owner).copied().unwrap_or(false).then_some(owner)
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.alive.get(&node).copied().unwrap_or(false)
    }

    fn live_nodes(&self) -> Vec<NodeId> {
        self.alive
            .iter()
            .filter_map(|(node, alive)| alive.then_some(*node))
            .collect()
    }
}

/// In-process substrate with simulated nodes and partition ownership.
///
/// Partition contents live outside the node that owns them, so when a node is
/// killed its partitions are promoted to a survivor with all data intact, the
/// way a synchronous backup would take over.
#[derive(Debug)]
pub struct LocalCluster {
    partitions: Vec<Arc<Mutex<PartitionData>>>,
    membership: RwLock<Membership>,
    feed: ChangeFeed,
}

impl LocalCluster {
    pub fn new(config: &ClusterConfig) -> Self {
        let node_count = config.nodes.max(1);
        let partitions = (0..config.partition_count)
            .map(|_| Arc::new(Mutex::new(PartitionData::default())))
            .collect();
        let membership = Membership {
            alive: (0..node_count).map(|node| (node, true)).collect(),
            owners: (0..config.partition_count)
                .map(|partition| Some(partition % node_count))
                .collect(),
        };

        Self {
            partitions,
            membership: RwLock::new(membership),
            feed: ChangeFeed::new(config.event_capacity),
        }
    }

    /// Cluster with `nodes` members and round-robin partition assignment.
    pub fn with_nodes(nodes: u32, partition_count: u32) -> Self {
        Self::new(&ClusterConfig {
            nodes,
            partition_count,
            ..ClusterConfig::default()
        })
    }

    /// Remove `node` from the cluster and hand its partitions to survivors.
    ///
    /// Returns the partitions that moved. Once the last node is gone every
    /// partition is left without an owner.
    pub async fn kill_node(&self, node: NodeId) -> Result<PartitionSet, SubstrateError> {
        let mut membership = self.membership.write().await;
        match membership.alive.get_mut(&node) {
            Some(alive) => *alive = false,
            None => return Err(SubstrateError::UnknownNode(node)),
        }

        let survivors = membership.live_nodes();
        let mut moved = PartitionSet::new();
        let mut next = 0usize;
        for (partition, owner) in membership.owners.iter_mut().enumerate() {
            if *owner != Some(node) {
                continue;
            }
            *owner = survivors.get(next % survivors.len().max(1)).copied();
            next += 1;
            moved.insert(partition as PartitionId);
        }

        if survivors.is_empty() {
            warn!(node, "last node left, partitions have no owner");
        } else {
            info!(node, moved = moved.len(), "node left, partitions promoted");
        }
        Ok(moved)
    }

    /// Bring a node (new or previously killed) into the cluster. It owns
    /// nothing until partitions are assigned to it.
    pub async fn add_node(&self, node: NodeId) {
        let mut membership = self.membership.write().await;
        membership.alive.insert(node, true);
        info!(node, "node joined");
    }

    /// Move ownership of `partition` to `node`.
    pub async fn assign(&self, partition: PartitionId, node: NodeId) -> Result<(), SubstrateError> {
        let mut membership = self.membership.write().await;
        if !membership.is_alive(node) {
            return Err(SubstrateError::UnknownNode(node));
        }
        let slot = membership
            .owners
            .get_mut(partition as usize)
            .ok_or(SubstrateError::UnknownPartition(partition))?;
        *slot = Some(node);
        Ok(())
    }

    pub async fn partitions_owned_by(&self, node: NodeId) -> PartitionSet {
        let membership = self.membership.read().await;
        (0..self.partitions.len() as PartitionId)
            .filter(|partition| membership.live_owner(*partition) == Some(node))
            .collect()
    }

    pub fn active_listeners(&self) -> usize {
        self.feed.active_listeners()
    }

    fn partition(
        &self,
        partition: PartitionId,
    ) -> Result<&Arc<Mutex<PartitionData>>, SubstrateError> {
        self.partitions
            .get(partition as usize)
            .ok_or(SubstrateError::UnknownPartition(partition))
    }

    async fn run<F, R>(&self, partition: PartitionId, f: F) -> Result<R, SubstrateError>
    where
        F: FnOnce(&mut PartitionData) -> R + Send,
        R: Send,
    {
        let (result, events) = {
            let mut data = self.partition(partition)?.lock().await;
            let result = f(&mut data);
            (result, data.take_events())
        };
        self.feed.publish(events);
        Ok(result)
    }
}

#[async_trait]
impl Substrate for LocalCluster {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.membership.read().await.live_owner(partition)
    }

    async fn is_alive(&self, node: NodeId) -> bool {
        self.membership.read().await.is_alive(node)
    }

    async fn live_nodes(&self) -> Vec<NodeId> {
        self.membership.read().await.live_nodes()
    }

    async fn transform<F, R>(&self, partition: PartitionId, f: F) -> Result<R, SubstrateError>
    where
        F: FnOnce(&mut PartitionData) -> R + Send,
        R: Send,
    {
        // Holding membership for the whole transform keeps ownership from
        // moving underneath it.
        let membership = self.membership.read().await;
        membership
            .live_owner(partition)
            .ok_or(SubstrateError::NoOwner(partition))?;
        let result = self.run(partition, f).await;
        drop(membership);
        result
    }

    async fn transform_on<F, R>(
        &self,
        node: NodeId,
        partition: PartitionId,
        f: F,
    ) -> Result<R, SubstrateError>
    where
        F: FnOnce(&mut PartitionData) -> R + Send,
        R: Send,
    {
        let membership = self.membership.read().await;
        if !membership.is_alive(node) {
            return Err(SubstrateError::NodeLeft(node));
        }
        if membership.live_owner(partition) != Some(node) {
            return Err(SubstrateError::NotOwner { node, partition });
        }
        let result = self.run(partition, f).await;
        drop(membership);
        result
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeListener {
        self.feed.subscribe(filter)
    }
}
