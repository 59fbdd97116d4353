use std::sync::Arc;

use crate::cache::MvccCache;
use crate::config::TidemarkConfig;
use crate::substrate::Substrate;
use crate::transaction::TransactionManager;
use crate::types::NodeId;

/// One member's view of the MVCC layer: its configuration, the substrate it
/// runs on, and the coordinator for the transactions it starts.
pub struct TidemarkNode<S: Substrate> {
    config: TidemarkConfig,
    substrate: Arc<S>,
    transactions: Arc<TransactionManager<S>>,
}

impl<S: Substrate> TidemarkNode<S> {
    pub fn new(config: TidemarkConfig, substrate: Arc<S>) -> Self {
        let transactions = Arc::new(TransactionManager::new(
            substrate.clone(),
            config.node_id,
            config.fan_out.clone(),
            config.transactions.clone(),
        ));
        Self {
            config,
            substrate,
            transactions,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &TidemarkConfig {
        &self.config
    }

    pub fn substrate(&self) -> &Arc<S> {
        &self.substrate
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager<S>> {
        &self.transactions
    }

    pub fn cache(&self, name: &str) -> MvccCache<S> {
        MvccCache::new(name, self.transactions.clone())
    }
}
