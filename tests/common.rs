use std::sync::Arc;
use std::time::Duration;

use tidemark::{
    ClusterConfig, FanOutConfig, LocalCluster, MvccCache, TidemarkConfig, TidemarkNode,
    TransactionConfig, TransactionId, TransactionManager,
};

#[allow(dead_code)]
pub fn ts(millis: u64) -> TransactionId {
    TransactionId::new(millis, 0, 0)
}

#[allow(dead_code)]
pub fn key(raw: &str) -> String {
    raw.to_string()
}

#[allow(dead_code)]
pub fn fast_fan_out() -> FanOutConfig {
    FanOutConfig {
        max_attempts: 5,
        retry_backoff_ms: 1,
    }
}

/// A local cluster plus one node driving transactions against it.
#[allow(dead_code)]
pub struct TestCluster {
    pub cluster: Arc<LocalCluster>,
    pub node: TidemarkNode<LocalCluster>,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new(nodes: u32, partitions: u32) -> Self {
        Self::with_transactions(nodes, partitions, TransactionConfig::default())
    }

    pub fn with_transactions(nodes: u32, partitions: u32, transactions: TransactionConfig) -> Self {
        let cluster_config = ClusterConfig {
            nodes,
            partition_count: partitions,
            ..ClusterConfig::default()
        };
        let cluster = Arc::new(LocalCluster::new(&cluster_config));
        let config = TidemarkConfig::new(0, cluster_config)
            .with_fan_out(fast_fan_out())
            .with_transactions(transactions);
        let node = TidemarkNode::new(config, cluster.clone());
        Self { cluster, node }
    }

    pub fn manager(&self) -> &Arc<TransactionManager<LocalCluster>> {
        self.node.transaction_manager()
    }

    pub fn cache(&self, name: &str) -> MvccCache<LocalCluster> {
        self.node.cache(name)
    }

    /// Wait until at least `count` change listeners are registered.
    pub async fn wait_for_listeners(&self, count: usize) {
        for _ in 0..2_000 {
            if self.cluster.active_listeners() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "expected {count} listeners, found {}",
            self.cluster.active_listeners()
        );
    }
}
