use async_trait::async_trait;

use crate::error::Result;
use crate::fanout::{RemoteUnit, UnitTarget};
use crate::processor::transform;
use crate::substrate::Substrate;
use crate::types::{CacheName, NodeId, TransactionId, VersionedKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Commit,
    Rollback,
}

/// Marks every version one transaction wrote in the targeted keys or
/// partitions as committed, or removes them.
///
/// Marking is idempotent, so a partition re-dispatched after node loss is
/// safe to sweep again.
#[derive(Debug, Clone)]
pub struct MarkUnit {
    pub cache: CacheName,
    pub txn: TransactionId,
    pub kind: SweepKind,
}

#[async_trait]
impl<S: Substrate> RemoteUnit<S> for MarkUnit {
    /// Number of versions whose state changed.
    type Output = usize;

    async fn run(&self, substrate: &S, node: NodeId, target: &UnitTarget) -> Result<usize> {
        let cache = self.cache.as_str();
        let txn = self.txn;
        let kind = self.kind;
        let marked = substrate
            .transform_on(node, target.partition, |data| match &target.keys {
                Some(keys) => keys
                    .iter()
                    .map(|key| VersionedKey::new(key.clone(), txn))
                    .filter(|version| match kind {
                        SweepKind::Commit => transform::commit_mark(data, cache, version),
                        SweepKind::Rollback => transform::rollback_mark(data, cache, version),
                    })
                    .count(),
                None => match kind {
                    SweepKind::Commit => transform::commit_all(data, cache, txn),
                    SweepKind::Rollback => transform::rollback_all(data, cache, txn),
                },
            })
            .await?;
        Ok(marked)
    }
}
