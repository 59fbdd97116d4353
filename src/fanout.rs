//! Retrying fan-out of per-partition work.
//!
//! A [`FanOut`] is created for one bulk operation. It splits the target by
//! current ownership, runs one task per owning node, and collects the
//! per-partition outcomes through a channel. Partitions whose delivery failed
//! because the node left are resolved again and sent to the new owner; a
//! logical failure aborts everything still in flight.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::FanOutConfig;
use crate::error::{MvccError, Result};
use crate::substrate::Substrate;
use crate::types::{Key, NodeId, PartitionId, PartitionSet};

/// The slice of work a unit handles in one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitTarget {
    pub partition: PartitionId,
    /// `None` addresses every key of the partition.
    pub keys: Option<Vec<Key>>,
}

/// Work that runs on the node owning a partition.
///
/// Implementations go through [`Substrate::transform_on`] with the node they
/// were given, so a unit that reaches a node which no longer owns the
/// partition fails with a delivery error instead of touching stale state.
#[async_trait]
pub trait RemoteUnit<S: Substrate>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn run(&self, substrate: &S, node: NodeId, target: &UnitTarget) -> Result<Self::Output>;
}

struct Delivery<T> {
    node: NodeId,
    target: UnitTarget,
    outcome: Result<T>,
}

/// Per-operation dispatch state. Consumed by [`FanOut::await_all`].
pub struct FanOut<S: Substrate, U: RemoteUnit<S>> {
    substrate: Arc<S>,
    unit: Arc<U>,
    config: FanOutConfig,
    attempts: HashMap<PartitionId, u32>,
    in_flight: usize,
    tasks: JoinSet<()>,
    sender: mpsc::UnboundedSender<Delivery<U::Output>>,
    receiver: mpsc::UnboundedReceiver<Delivery<U::Output>>,
}

impl<S: Substrate, U: RemoteUnit<S>> FanOut<S, U> {
    pub fn new(substrate: Arc<S>, unit: U, config: FanOutConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            substrate,
            unit: Arc::new(unit),
            config,
            attempts: HashMap::new(),
            in_flight: 0,
            tasks: JoinSet::new(),
            sender,
            receiver,
        }
    }

    /// Dispatch `keys`, grouped by partition and then by owning node.
    pub async fn dispatch_for_keys<I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = Key>,
    {
        let mut by_partition: BTreeMap<PartitionId, Vec<Key>> = BTreeMap::new();
        for key in keys {
            let partition = self.substrate.partition_for_key(&key);
            by_partition.entry(partition).or_default().push(key);
        }
        let targets = by_partition
            .into_iter()
            .map(|(partition, keys)| UnitTarget {
                partition,
                keys: Some(keys),
            })
            .collect();
        self.dispatch(targets).await
    }

    /// Dispatch whole partitions, grouped by owning node.
    pub async fn dispatch_for_partitions(&mut self, partitions: &PartitionSet) -> Result<()> {
        let targets = partitions
            .iter()
            .map(|partition| UnitTarget {
                partition,
                keys: None,
            })
            .collect();
        self.dispatch(targets).await
    }

    async fn dispatch(&mut self, targets: Vec<UnitTarget>) -> Result<()> {
        let mut remaining = targets;
        // Ownership can move between the lookup and the hand-off, so keep
        // resolving until every target has an owner to go to.
        while !remaining.is_empty() {
            let mut by_node: BTreeMap<NodeId, Vec<UnitTarget>> = BTreeMap::new();
            let mut unassigned = Vec::new();
            for target in remaining {
                let attempts = self.attempts.entry(target.partition).or_insert(0);
                *attempts += 1;
                if *attempts > self.config.max_attempts {
                    return Err(self.unavailable(target.partition));
                }
                match self.substrate.owner_of(target.partition).await {
                    Some(node) => by_node.entry(node).or_default().push(target),
                    None => unassigned.push(target),
                }
            }
            for (node, targets) in by_node {
                self.spawn_node_task(node, targets);
            }
            if !unassigned.is_empty() {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
            remaining = unassigned;
        }
        Ok(())
    }

    fn spawn_node_task(&mut self, node: NodeId, targets: Vec<UnitTarget>) {
        self.in_flight += targets.len();
        let substrate = self.substrate.clone();
        let unit = self.unit.clone();
        let sender = self.sender.clone();
        self.tasks.spawn(async move {
            for target in targets {
                let outcome = unit.run(&substrate, node, &target).await;
                if sender
                    .send(Delivery {
                        node,
                        target,
                        outcome,
                    })
                    .is_err()
                {
                    return;
                }
            }
        });
    }

    fn unavailable(&self, partition: PartitionId) -> MvccError {
        MvccError::Unavailable(format!(
            "partition {partition} could not be reached after {} attempts",
            self.config.max_attempts
        ))
    }

    /// Wait for every dispatched partition to report.
    ///
    /// Returns one output per partition, ordered by partition id.
    pub async fn await_all(mut self) -> Result<Vec<(PartitionId, U::Output)>> {
        let mut outputs = Vec::with_capacity(self.in_flight);
        while self.in_flight > 0 {
            let delivery = tokio::select! {
                delivery = self.receiver.recv() => delivery,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = joined
                        && err.is_panic()
                    {
                        self.tasks.abort_all();
                        return Err(MvccError::Unavailable(format!("fan-out unit panicked: {err}")));
                    }
                    continue;
                }
            };
            // The coordinator holds a sender, so the channel cannot close.
            let Some(delivery) = delivery else {
                break;
            };
            self.in_flight -= 1;

            match delivery.outcome {
                Ok(output) => outputs.push((delivery.target.partition, output)),
                Err(err) if err.is_delivery_failure() => {
                    debug!(
                        node = delivery.node,
                        partition = delivery.target.partition,
                        error = %err,
                        "re-dispatching partition after delivery failure"
                    );
                    if let Err(err) = self.redispatch(delivery.target).await {
                        self.tasks.abort_all();
                        return Err(err);
                    }
                }
                Err(err) => {
                    warn!(
                        node = delivery.node,
                        partition = delivery.target.partition,
                        error = %err,
                        "fan-out unit failed, aborting outstanding units"
                    );
                    self.tasks.abort_all();
                    return Err(err);
                }
            }
        }
        outputs.sort_by_key(|(partition, _)| *partition);
        Ok(outputs)
    }

    async fn redispatch(&mut self, target: UnitTarget) -> Result<()> {
        tokio::time::sleep(self.config.retry_backoff()).await;
        self.dispatch(vec![target]).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::processor::ProcessorError;
    use crate::substrate::LocalCluster;

    struct CountingUnit {
        runs: Arc<AtomicUsize>,
        fail_partition: Option<PartitionId>,
    }

    #[async_trait]
    impl RemoteUnit<LocalCluster> for CountingUnit {
        type Output = usize;

        async fn run(
            &self,
            substrate: &LocalCluster,
            node: NodeId,
            target: &UnitTarget,
        ) -> Result<usize> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_partition == Some(target.partition) {
                return Err(ProcessorError::new("rejected").into());
            }
            let keys = target.keys.as_ref().map_or(0, Vec::len);
            substrate.transform_on(node, target.partition, |_| ()).await?;
            Ok(keys)
        }
    }

    fn config() -> FanOutConfig {
        FanOutConfig {
            max_attempts: 3,
            retry_backoff_ms: 0,
        }
    }

    #[tokio::test]
    async fn keys_are_grouped_per_partition() {
        let cluster = Arc::new(LocalCluster::with_nodes(3, 8));
        let runs = Arc::new(AtomicUsize::new(0));
        let unit = CountingUnit {
            runs: runs.clone(),
            fail_partition: None,
        };
        let keys: Vec<Key> = (0..40).map(|i| format!("key-{i}")).collect();
        let partitions: PartitionSet = keys.iter().map(|k| cluster.partition_for_key(k)).collect();

        let mut fan_out = FanOut::new(cluster.clone(), unit, config());
        fan_out.dispatch_for_keys(keys).await.unwrap();
        let outputs = fan_out.await_all().await.unwrap();

        assert_eq!(outputs.len(), partitions.len());
        assert_eq!(outputs.iter().map(|(_, n)| n).sum::<usize>(), 40);
        assert_eq!(runs.load(Ordering::SeqCst), partitions.len());
    }

    #[tokio::test]
    async fn logical_error_aborts_the_operation() {
        let cluster = Arc::new(LocalCluster::with_nodes(2, 4));
        let unit = CountingUnit {
            runs: Arc::new(AtomicUsize::new(0)),
            fail_partition: Some(2),
        };
        let mut fan_out = FanOut::new(cluster, unit, config());
        fan_out
            .dispatch_for_partitions(&PartitionSet::all(4))
            .await
            .unwrap();
        let err = fan_out.await_all().await.unwrap_err();
        assert!(matches!(err, MvccError::Processor(_)));
    }

    #[tokio::test]
    async fn no_live_owner_is_unavailable() {
        let cluster = Arc::new(LocalCluster::with_nodes(1, 2));
        cluster.kill_node(0).await.unwrap();
        let unit = CountingUnit {
            runs: Arc::new(AtomicUsize::new(0)),
            fail_partition: None,
        };
        let mut fan_out = FanOut::new(cluster, unit, config());
        let err = fan_out
            .dispatch_for_partitions(&PartitionSet::all(2))
            .await
            .unwrap_err();
        assert!(matches!(err, MvccError::Unavailable(_)));
    }
}
