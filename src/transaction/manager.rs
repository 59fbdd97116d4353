use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::{TransactionIdGenerator, now_millis};
use crate::config::{FanOutConfig, TransactionConfig};
use crate::error::{MvccError, Result};
use crate::fanout::FanOut;
use crate::substrate::{ProcStatus, Substrate, TxnStatusRecord};
use crate::types::{CacheName, IsolationLevel, Key, NodeId, PartitionSet, TransactionId};

use super::sweep::{MarkUnit, SweepKind};
use super::{Transaction, TransactionError, TransactionMetadata, TransactionState};

/// Begins transactions and drives their commit or rollback.
///
/// Commit and rollback are a guarded flip of the durable status record
/// followed by a sweep over everything the transaction recorded as changed.
pub struct TransactionManager<S: Substrate> {
    substrate: Arc<S>,
    ids: TransactionIdGenerator,
    fan_out: FanOutConfig,
    config: TransactionConfig,
}

impl<S: Substrate> TransactionManager<S> {
    pub fn new(
        substrate: Arc<S>,
        node_id: NodeId,
        fan_out: FanOutConfig,
        config: TransactionConfig,
    ) -> Self {
        Self {
            substrate,
            ids: TransactionIdGenerator::new(node_id),
            fan_out,
            config,
        }
    }

    pub fn substrate(&self) -> &Arc<S> {
        &self.substrate
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn fan_out_config(&self) -> &FanOutConfig {
        &self.fan_out
    }

    /// A fresh id from this node's generator.
    pub fn next_id(&self) -> TransactionId {
        self.ids.next_id()
    }

    pub async fn begin(
        &self,
        isolation: IsolationLevel,
        auto_commit: bool,
    ) -> Result<Arc<Transaction>> {
        self.begin_with_id(self.next_id(), isolation, auto_commit)
            .await
    }

    /// Begin with the configured default isolation.
    pub async fn begin_default(&self) -> Result<Arc<Transaction>> {
        self.begin(self.config.default_isolation, false).await
    }

    pub async fn begin_with_id(
        &self,
        id: TransactionId,
        isolation: IsolationLevel,
        auto_commit: bool,
    ) -> Result<Arc<Transaction>> {
        let partition = self.substrate.partition_for_txn(&id);
        let record = TxnStatusRecord::open(now_millis());
        let inserted = self
            .substrate
            .transform(partition, move |data| data.insert_status(id, record))
            .await?;
        if !inserted {
            return Err(TransactionError::Duplicate(id).into());
        }

        info!(txn = %id, ?isolation, auto_commit, "transaction started");
        Ok(Arc::new(Transaction::new(TransactionMetadata::new(
            id,
            isolation,
            auto_commit,
        ))))
    }

    pub async fn record_touched<I>(&self, txn: &Transaction, cache: &str, keys: I)
    where
        I: IntoIterator<Item = Key>,
    {
        txn.add_keys(cache, keys).await;
    }

    pub async fn record_touched_partitions(
        &self,
        txn: &Transaction,
        cache: &str,
        partitions: &PartitionSet,
    ) {
        txn.add_partitions(cache, partitions).await;
    }

    /// Record the entries one operation changed. Past `key_tracking_limit`
    /// keys of one cache, their partitions are recorded instead.
    pub async fn record_changes(&self, txn: &Transaction, changed: Vec<(CacheName, Key)>) {
        if txn.auto_commit() || changed.is_empty() {
            return;
        }
        let mut by_cache: BTreeMap<CacheName, Vec<Key>> = BTreeMap::new();
        for (cache, key) in changed {
            by_cache.entry(cache).or_default().push(key);
        }
        for (cache, keys) in by_cache {
            if keys.len() > self.config.key_tracking_limit {
                let partitions: PartitionSet = keys
                    .iter()
                    .map(|key| self.substrate.partition_for_key(key))
                    .collect();
                debug!(
                    txn = %txn.id(),
                    cache = %cache,
                    keys = keys.len(),
                    "tracking partitions instead of keys"
                );
                self.record_touched_partitions(txn, &cache, &partitions)
                    .await;
            } else {
                self.record_touched(txn, &cache, keys).await;
            }
        }
    }

    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_open().await?;
        if txn.is_rollback_only() {
            return Err(TransactionError::RollbackOnly(txn.id()).into());
        }

        self.flip(txn.id(), &[ProcStatus::Open], ProcStatus::Committing)
            .await?;
        let marked = self.sweep(txn, SweepKind::Commit).await?;
        self.remove_status(txn.id()).await?;
        txn.set_state(TransactionState::Committed).await;
        info!(txn = %txn.id(), marked, "transaction committed");
        Ok(())
    }

    /// Roll back an open transaction, including one that was rollback-only
    /// or already force-expired.
    pub async fn rollback(&self, txn: &Transaction) -> Result<()> {
        txn.ensure_open().await?;

        self.flip(
            txn.id(),
            &[ProcStatus::Open, ProcStatus::RollingBack],
            ProcStatus::RollingBack,
        )
        .await?;
        let removed = self.sweep(txn, SweepKind::Rollback).await?;
        self.remove_status(txn.id()).await?;
        txn.set_state(TransactionState::RolledBack).await;
        info!(txn = %txn.id(), removed, "transaction rolled back");
        Ok(())
    }

    /// Force an open transaction into rolling back. Every wait performed by
    /// that transaction ends with [`MvccError::TransactionExpired`]; its
    /// versions are removed once its owner calls [`Self::rollback`].
    pub async fn expire(&self, id: TransactionId) -> Result<()> {
        self.flip(id, &[ProcStatus::Open], ProcStatus::RollingBack)
            .await?;
        warn!(txn = %id, "transaction expired");
        Ok(())
    }

    /// Expire every open transaction whose status record is older than
    /// `max_age`. Returns the ids that were expired.
    pub async fn expire_stale(&self, max_age: Duration) -> Result<Vec<TransactionId>> {
        let max_age_ms = max_age.as_millis() as u64;
        let mut expired = Vec::new();
        for partition in 0..self.substrate.partition_count() {
            let now = now_millis();
            let stale = self
                .substrate
                .transform(partition, move |data| {
                    let stale: Vec<TransactionId> = data
                        .statuses()
                        .filter(|(_, record)| {
                            record.proc_status == ProcStatus::Open
                                && now.saturating_sub(record.started_at_millis) >= max_age_ms
                        })
                        .map(|(id, _)| *id)
                        .collect();
                    for id in &stale {
                        data.set_status(*id, ProcStatus::RollingBack);
                    }
                    stale
                })
                .await?;
            expired.extend(stale);
        }
        for id in &expired {
            warn!(txn = %id, "stale transaction expired");
        }
        expired.sort();
        Ok(expired)
    }

    /// Commit the versions an autocommit bulk call wrote to `keys`.
    pub(crate) async fn commit_keys(
        &self,
        id: TransactionId,
        cache: &str,
        keys: Vec<Key>,
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut fan_out = self.fan_out(cache, id, SweepKind::Commit);
        fan_out.dispatch_for_keys(keys).await?;
        let outputs = fan_out.await_all().await?;
        Ok(outputs.iter().map(|(_, count)| count).sum())
    }

    /// Remove every uncommitted version `id` wrote to `cache` in
    /// `partitions`.
    pub(crate) async fn rollback_partitions(
        &self,
        id: TransactionId,
        cache: &str,
        partitions: &PartitionSet,
    ) -> Result<usize> {
        let mut fan_out = self.fan_out(cache, id, SweepKind::Rollback);
        fan_out.dispatch_for_partitions(partitions).await?;
        let outputs = fan_out.await_all().await?;
        Ok(outputs.iter().map(|(_, count)| count).sum())
    }

    pub async fn status_of(&self, id: TransactionId) -> Result<Option<ProcStatus>> {
        let partition = self.substrate.partition_for_txn(&id);
        let status = self
            .substrate
            .transform(partition, move |data| {
                data.status(&id).map(|record| record.proc_status)
            })
            .await?;
        Ok(status)
    }

    /// Move the status record of `id` to `to`, failing unless it is
    /// currently in one of `from`.
    async fn flip(&self, id: TransactionId, from: &[ProcStatus], to: ProcStatus) -> Result<()> {
        let partition = self.substrate.partition_for_txn(&id);
        let expected = from[0];
        let outcome = self
            .substrate
            .transform(partition, |data| {
                let Some(record) = data.status(&id) else {
                    return Err(TransactionError::MissingStatus(id));
                };
                let found = record.proc_status;
                if !from.contains(&found) {
                    return Err(TransactionError::StatusMismatch {
                        id,
                        expected,
                        found,
                    });
                }
                if found != to {
                    data.set_status(id, to);
                }
                Ok(())
            })
            .await?;
        outcome.map_err(MvccError::from)
    }

    async fn remove_status(&self, id: TransactionId) -> Result<()> {
        let partition = self.substrate.partition_for_txn(&id);
        self.substrate
            .transform(partition, move |data| data.remove_status(&id))
            .await?;
        Ok(())
    }

    /// One fan-out per cache for tracked keys and one per cache for tracked
    /// partitions, all running concurrently.
    async fn sweep(&self, txn: &Transaction, kind: SweepKind) -> Result<usize> {
        let id = txn.id();
        let mut sweeps = JoinSet::new();

        for (cache, keys) in txn.affected_keys().await {
            let mut fan_out = self.fan_out(&cache, id, kind);
            sweeps.spawn(async move {
                fan_out.dispatch_for_keys(keys).await?;
                fan_out.await_all().await
            });
        }
        for (cache, partitions) in txn.affected_partitions().await {
            let mut fan_out = self.fan_out(&cache, id, kind);
            sweeps.spawn(async move {
                fan_out.dispatch_for_partitions(&partitions).await?;
                fan_out.await_all().await
            });
        }

        let mut marked = 0;
        while let Some(joined) = sweeps.join_next().await {
            let outcome = joined
                .map_err(|err| MvccError::Unavailable(format!("sweep task failed: {err}")))
                .and_then(|outcome| outcome);
            match outcome {
                Ok(outputs) => marked += outputs.iter().map(|(_, count)| count).sum::<usize>(),
                Err(err) => {
                    sweeps.abort_all();
                    warn!(txn = %id, ?kind, error = %err, "sweep failed");
                    return Err(TransactionError::SweepFailed {
                        id,
                        reason: err.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(marked)
    }

    fn fan_out(&self, cache: &str, txn: TransactionId, kind: SweepKind) -> FanOut<S, MarkUnit> {
        let unit = MarkUnit {
            cache: cache.to_string(),
            txn,
            kind,
        };
        FanOut::new(self.substrate.clone(), unit, self.fan_out.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::LocalCluster;

    fn manager(nodes: u32) -> TransactionManager<LocalCluster> {
        TransactionManager::new(
            Arc::new(LocalCluster::with_nodes(nodes, 8)),
            0,
            FanOutConfig {
                max_attempts: 3,
                retry_backoff_ms: 0,
            },
            TransactionConfig::default(),
        )
    }

    #[tokio::test]
    async fn status_record_lifecycle() {
        let manager = manager(2);
        let txn = manager
            .begin(IsolationLevel::RepeatableRead, false)
            .await
            .unwrap();
        assert_eq!(
            manager.status_of(txn.id()).await.unwrap(),
            Some(ProcStatus::Open)
        );
        manager.commit(&txn).await.unwrap();
        assert_eq!(manager.status_of(txn.id()).await.unwrap(), None);
        assert_eq!(txn.state().await, TransactionState::Committed);
    }

    #[tokio::test]
    async fn expire_then_rollback() {
        let manager = manager(1);
        let txn = manager.begin_default().await.unwrap();
        manager.expire(txn.id()).await.unwrap();
        assert_eq!(
            manager.status_of(txn.id()).await.unwrap(),
            Some(ProcStatus::RollingBack)
        );

        let err = manager.commit(&txn).await.unwrap_err();
        assert!(matches!(
            err,
            MvccError::Transaction(TransactionError::StatusMismatch {
                found: ProcStatus::RollingBack,
                ..
            })
        ));
        manager.rollback(&txn).await.unwrap();
        assert_eq!(txn.state().await, TransactionState::RolledBack);
    }

    #[tokio::test]
    async fn expire_stale_only_touches_open_records() {
        let manager = manager(2);
        let open = manager.begin_default().await.unwrap();
        let expired = manager.begin_default().await.unwrap();
        manager.expire(expired.id()).await.unwrap();

        assert!(manager.expire_stale(Duration::from_secs(3600)).await.unwrap().is_empty());
        let swept = manager.expire_stale(Duration::ZERO).await.unwrap();
        assert_eq!(swept, vec![open.id()]);
    }
}
