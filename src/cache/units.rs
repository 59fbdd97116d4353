use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::fanout::{RemoteUnit, UnitTarget};
use crate::processor::transform::{self, ProcessorResult, ScanOutcome, TransformContext};
use crate::processor::Reducer;
use crate::substrate::{PartitionData, Substrate};
use crate::types::{CacheName, Key, NodeId, Value, VersionedKey};

/// One per-key transform, shareable across partitions and retries.
pub type EntryOp<R> = Arc<
    dyn Fn(&mut PartitionData, &TransformContext, &Key) -> Result<ProcessorResult<Key, R>>
        + Send
        + Sync,
>;

pub fn entry_op<R, F>(f: F) -> EntryOp<R>
where
    F: Fn(&mut PartitionData, &TransformContext, &Key) -> Result<ProcessorResult<Key, R>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Runs an [`EntryOp`] over the targeted keys, or every key of the targeted
/// partition, in a single transform.
pub struct EntryUnit<R> {
    pub ctx: TransformContext,
    pub op: EntryOp<R>,
}

#[async_trait]
impl<S: Substrate, R: Send + 'static> RemoteUnit<S> for EntryUnit<R> {
    type Output = ScanOutcome<R>;

    async fn run(
        &self,
        substrate: &S,
        node: NodeId,
        target: &UnitTarget,
    ) -> Result<ScanOutcome<R>> {
        let ctx = &self.ctx;
        let op = &self.op;
        substrate
            .transform_on(node, target.partition, |data| match &target.keys {
                Some(keys) => transform::scan_keys(data, keys, |data, key| op(data, ctx, key)),
                None => transform::scan(data, ctx, |data, key| op(data, ctx, key)),
            })
            .await?
    }
}

/// What a reducing unit sends back for one partition.
#[derive(Debug, Clone, Default)]
pub struct Reduced {
    pub partial: Option<Value>,
    pub blocked: Vec<(Key, VersionedKey<Key>)>,
    pub changed: Vec<(CacheName, Key)>,
}

/// An [`EntryUnit`] whose results are reduced on the owning node before
/// they travel back.
pub struct ReducingUnit {
    pub inner: EntryUnit<Value>,
    pub reducer: Arc<dyn Reducer>,
}

#[async_trait]
impl<S: Substrate> RemoteUnit<S> for ReducingUnit {
    type Output = Reduced;

    async fn run(&self, substrate: &S, node: NodeId, target: &UnitTarget) -> Result<Reduced> {
        let outcome =
            <EntryUnit<Value> as RemoteUnit<S>>::run(&self.inner, substrate, node, target).await?;
        let partial = if outcome.hits.is_empty() {
            None
        } else {
            let values = outcome.hits.into_iter().map(|hit| hit.result).collect();
            self.reducer.reduce(values)?
        };
        Ok(Reduced {
            partial,
            blocked: outcome.blocked,
            changed: outcome.changed,
        })
    }
}
