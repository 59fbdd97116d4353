//! Client-facing cache view with MVCC semantics.
//!
//! Every call runs under a [`Transaction`]. Entries blocked behind another
//! transaction's uncommitted version are waited on and retried here, so
//! callers only ever see final results or errors.

pub mod units;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MvccError, Result};
use crate::fanout::{FanOut, RemoteUnit};
use crate::processor::transform::{self, ProcessorResult, TransformContext};
use crate::processor::{
    AcceptAll, EntryFilter, EntryProcessor, InsertProcessor, Processing, PutProcessor, Reducer,
    RemoveProcessor,
};
use crate::substrate::Substrate;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{CacheName, Key, PartitionSet, Value, VersionedKey};
use crate::wait::{WaitOutcome, wait_for_commit};

use units::{EntryOp, EntryUnit, Reduced, ReducingUnit, entry_op};

/// Result of a bulk invoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeResult {
    /// Value returned by the processor for every key that produced one.
    PerKey(BTreeMap<Key, Value>),
    Reduced(Option<Value>),
}

enum Target {
    Keys(Vec<Key>),
    AllPartitions,
}

/// A named key space of the substrate.
pub struct MvccCache<S: Substrate> {
    name: CacheName,
    substrate: Arc<S>,
    transactions: Arc<TransactionManager<S>>,
}

impl<S: Substrate> Clone for MvccCache<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            substrate: self.substrate.clone(),
            transactions: self.transactions.clone(),
        }
    }
}

impl<S: Substrate> MvccCache<S> {
    pub fn new(name: impl Into<CacheName>, transactions: Arc<TransactionManager<S>>) -> Self {
        Self {
            name: name.into(),
            substrate: transactions.substrate().clone(),
            transactions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, txn: &Transaction, key: &Key) -> Result<Option<Value>> {
        self.single(txn, key, entry_op(transform::read)).await
    }

    pub async fn get_all<I>(&self, txn: &Transaction, keys: I) -> Result<BTreeMap<Key, Value>>
    where
        I: IntoIterator<Item = Key>,
    {
        let target = Target::Keys(keys.into_iter().collect());
        let hits = self.bulk(txn, target, entry_op(transform::read), false).await?;
        Ok(hits.into_iter().collect())
    }

    /// Store `value`, returning the value it replaced.
    pub async fn put(&self, txn: &Transaction, key: &Key, value: Value) -> Result<Option<Value>> {
        self.invoke(txn, key, Arc::new(PutProcessor(value))).await
    }

    /// Store `value` unless the key already has a visible value.
    pub async fn insert(&self, txn: &Transaction, key: &Key, value: Value) -> Result<()> {
        self.invoke(txn, key, Arc::new(InsertProcessor(value)))
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, txn: &Transaction, key: &Key) -> Result<Option<Value>> {
        self.invoke(txn, key, Arc::new(RemoveProcessor)).await
    }

    /// Run `processor` against one key.
    pub async fn invoke(
        &self,
        txn: &Transaction,
        key: &Key,
        processor: Arc<dyn EntryProcessor>,
    ) -> Result<Option<Value>> {
        self.single(txn, key, write_op(processor, None)).await
    }

    pub async fn invoke_all<I>(
        &self,
        txn: &Transaction,
        keys: I,
        processing: Processing,
    ) -> Result<InvokeResult>
    where
        I: IntoIterator<Item = Key>,
    {
        let target = Target::Keys(keys.into_iter().collect());
        self.invoke_target(txn, target, processing, None).await
    }

    /// Run the processing over every visible entry matching `filter`.
    pub async fn invoke_filtered(
        &self,
        txn: &Transaction,
        filter: Arc<dyn EntryFilter>,
        processing: Processing,
    ) -> Result<InvokeResult> {
        self.invoke_target(txn, Target::AllPartitions, processing, Some(filter))
            .await
    }

    pub async fn contains_key(&self, txn: &Transaction, key: &Key) -> Result<bool> {
        let found = self.single(txn, key, entry_op(transform::exists)).await?;
        Ok(found.unwrap_or(false))
    }

    pub async fn contains_value(&self, txn: &Transaction, value: Value) -> Result<bool> {
        let expected = Arc::new(value);
        let op = entry_op(move |data, ctx, key| {
            Ok(match transform::contains_value(data, ctx, key, &expected)? {
                ProcessorResult::Done {
                    result: Some(false),
                    changed,
                } => ProcessorResult::Done {
                    result: None,
                    changed,
                },
                other => other,
            })
        });
        let hits = self.bulk(txn, Target::AllPartitions, op, false).await?;
        Ok(!hits.is_empty())
    }

    /// Every key with a visible value.
    pub async fn keys(&self, txn: &Transaction) -> Result<Vec<Key>> {
        let entries = self.entries(txn, Arc::new(AcceptAll)).await?;
        Ok(entries.into_keys().collect())
    }

    /// Every visible entry matching `filter`.
    pub async fn entries(
        &self,
        txn: &Transaction,
        filter: Arc<dyn EntryFilter>,
    ) -> Result<BTreeMap<Key, Value>> {
        let hits = self
            .bulk(txn, Target::AllPartitions, select_op(filter), false)
            .await?;
        Ok(hits.into_iter().collect())
    }

    /// Reduce the values of every visible entry matching `filter`.
    pub async fn aggregate(
        &self,
        txn: &Transaction,
        filter: Arc<dyn EntryFilter>,
        reducer: Arc<dyn Reducer>,
    ) -> Result<Option<Value>> {
        self.reduce(txn, Target::AllPartitions, select_op(filter), reducer, false)
            .await
    }

    async fn invoke_target(
        &self,
        txn: &Transaction,
        target: Target,
        processing: Processing,
        filter: Option<Arc<dyn EntryFilter>>,
    ) -> Result<InvokeResult> {
        let op = write_op(processing.processor().clone(), filter);
        match processing.reducer() {
            None => {
                let hits = self.bulk(txn, target, op, true).await?;
                Ok(InvokeResult::PerKey(hits.into_iter().collect()))
            }
            Some(reducer) => {
                let reduced = self.reduce(txn, target, op, reducer.clone(), true).await?;
                Ok(InvokeResult::Reduced(reduced))
            }
        }
    }

    fn context(&self, txn: &Transaction) -> TransformContext {
        TransformContext::new(self.name.clone(), txn.metadata())
    }

    /// Context for the transforms of one bulk call. Autocommit writes are
    /// stored uncommitted and committed together once the whole call has
    /// succeeded.
    fn bulk_context(&self, txn: &Transaction, writes: bool) -> TransformContext {
        let mut ctx = self.context(txn);
        if writes {
            ctx.meta.auto_commit = false;
        }
        ctx
    }

    /// Run `op` on one key, waiting out and retrying blocked attempts.
    async fn single<R: Send + 'static>(
        &self,
        txn: &Transaction,
        key: &Key,
        op: EntryOp<R>,
    ) -> Result<Option<R>> {
        txn.ensure_open().await?;
        let ctx = self.context(txn);
        let (result, changed) = self.attempt(txn, &ctx, key, &op).await?;
        self.transactions.record_changes(txn, changed).await;
        Ok(result)
    }

    async fn attempt<R: Send + 'static>(
        &self,
        txn: &Transaction,
        ctx: &TransformContext,
        key: &Key,
        op: &EntryOp<R>,
    ) -> Result<(Option<R>, Vec<(CacheName, Key)>)> {
        let partition = self.substrate.partition_for_key(key);
        loop {
            let outcome = self
                .substrate
                .transform(partition, |data| op(data, ctx, key))
                .await??;
            match outcome {
                ProcessorResult::Blocked(version) => self.wait(txn, &version).await?,
                ProcessorResult::Done { result, changed } => return Ok((result, changed)),
            }
        }
    }

    async fn wait(&self, txn: &Transaction, version: &VersionedKey<Key>) -> Result<()> {
        debug!(txn = %txn.id(), %version, cache = %self.name, "entry blocked");
        match wait_for_commit(&*self.substrate, &self.name, version, txn.id()).await? {
            WaitOutcome::Resolved => Ok(()),
            WaitOutcome::CallerExpired => Err(MvccError::TransactionExpired(txn.id())),
        }
    }

    /// Fan `unit` out over `target` and collect the per-partition outputs.
    async fn fan_out<U>(&self, target: &Target, unit: U) -> Result<Vec<U::Output>>
    where
        U: RemoteUnit<S>,
    {
        let mut fan_out = FanOut::new(
            self.substrate.clone(),
            unit,
            self.transactions.fan_out_config().clone(),
        );
        match target {
            Target::Keys(keys) => fan_out.dispatch_for_keys(keys.iter().cloned()).await?,
            Target::AllPartitions => {
                let all = PartitionSet::all(self.substrate.partition_count());
                fan_out.dispatch_for_partitions(&all).await?
            }
        }
        let outputs = fan_out.await_all().await?;
        Ok(outputs.into_iter().map(|(_, output)| output).collect())
    }

    fn target_partitions(&self, target: &Target) -> PartitionSet {
        match target {
            Target::Keys(keys) => keys
                .iter()
                .map(|key| self.substrate.partition_for_key(key))
                .collect(),
            Target::AllPartitions => PartitionSet::all(self.substrate.partition_count()),
        }
    }

    /// Finish a bulk call, which either applies completely or not at all.
    ///
    /// - A successful call records its changes, or commits them at once
    ///   under autocommit.
    /// - A failed write records every targeted partition and turns the
    ///   transaction rollback-only. Under autocommit the versions it left
    ///   behind are removed instead.
    async fn settle<T>(
        &self,
        txn: &Transaction,
        target: &Target,
        writes: bool,
        outcome: Result<(T, Vec<(CacheName, Key)>)>,
    ) -> Result<T> {
        let err = match outcome {
            Ok((value, changed)) => {
                if writes && txn.auto_commit() {
                    let keys = changed.into_iter().map(|(_, key)| key).collect();
                    self.transactions
                        .commit_keys(txn.id(), &self.name, keys)
                        .await?;
                } else {
                    self.transactions.record_changes(txn, changed).await;
                }
                return Ok(value);
            }
            Err(err) => err,
        };
        if !writes {
            return Err(err);
        }

        let touched = self.target_partitions(target);
        if txn.auto_commit() {
            warn!(
                txn = %txn.id(),
                cache = %self.name,
                error = %err,
                "autocommit bulk operation failed, removing its versions"
            );
            if let Err(undo) = self
                .transactions
                .rollback_partitions(txn.id(), &self.name, &touched)
                .await
            {
                warn!(txn = %txn.id(), error = %undo, "removing autocommit versions failed");
            }
        } else {
            self.transactions
                .record_touched_partitions(txn, &self.name, &touched)
                .await;
            txn.set_rollback_only();
            warn!(
                txn = %txn.id(),
                cache = %self.name,
                error = %err,
                "bulk operation failed, transaction is rollback-only"
            );
        }
        Err(err)
    }

    /// Bulk operation returning one result per key. Blocked keys are waited
    /// on and retried one by one once the fan-out has finished.
    async fn bulk<R: Send + 'static>(
        &self,
        txn: &Transaction,
        target: Target,
        op: EntryOp<R>,
        writes: bool,
    ) -> Result<Vec<(Key, R)>> {
        txn.ensure_open().await?;
        let ctx = self.bulk_context(txn, writes);
        let outcome = self.collect(txn, &ctx, &target, op).await;
        self.settle(txn, &target, writes, outcome).await
    }

    async fn collect<R: Send + 'static>(
        &self,
        txn: &Transaction,
        ctx: &TransformContext,
        target: &Target,
        op: EntryOp<R>,
    ) -> Result<(Vec<(Key, R)>, Vec<(CacheName, Key)>)> {
        let unit = EntryUnit {
            ctx: ctx.clone(),
            op: op.clone(),
        };
        let outputs = self.fan_out(target, unit).await?;

        let mut hits = Vec::new();
        let mut changed = Vec::new();
        let mut blocked = Vec::new();
        for outcome in outputs {
            hits.extend(outcome.hits.into_iter().map(|hit| (hit.key, hit.result)));
            changed.extend(outcome.changed);
            blocked.extend(outcome.blocked);
        }

        for (key, version) in blocked {
            self.wait(txn, &version).await?;
            let (result, retried) = self.attempt(txn, ctx, &key, &op).await?;
            changed.extend(retried);
            if let Some(result) = result {
                hits.push((key, result));
            }
        }
        Ok((hits, changed))
    }

    /// Bulk operation whose results are reduced per partition and then once
    /// more across partitions.
    async fn reduce(
        &self,
        txn: &Transaction,
        target: Target,
        op: EntryOp<Value>,
        reducer: Arc<dyn Reducer>,
        writes: bool,
    ) -> Result<Option<Value>> {
        txn.ensure_open().await?;
        let ctx = self.bulk_context(txn, writes);
        let outcome = self.collect_reduced(txn, &ctx, &target, op, reducer).await;
        self.settle(txn, &target, writes, outcome).await
    }

    async fn collect_reduced(
        &self,
        txn: &Transaction,
        ctx: &TransformContext,
        target: &Target,
        op: EntryOp<Value>,
        reducer: Arc<dyn Reducer>,
    ) -> Result<(Option<Value>, Vec<(CacheName, Key)>)> {
        let unit = ReducingUnit {
            inner: EntryUnit {
                ctx: ctx.clone(),
                op: op.clone(),
            },
            reducer: reducer.clone(),
        };
        let outputs: Vec<Reduced> = self.fan_out(target, unit).await?;

        let mut partials = Vec::new();
        let mut changed = Vec::new();
        let mut blocked = Vec::new();
        for reduced in outputs {
            partials.extend(reduced.partial);
            changed.extend(reduced.changed);
            blocked.extend(reduced.blocked);
        }

        let mut retried = Vec::new();
        for (key, version) in blocked {
            self.wait(txn, &version).await?;
            let (result, more) = self.attempt(txn, ctx, &key, &op).await?;
            changed.extend(more);
            retried.extend(result);
        }
        if !retried.is_empty() {
            partials.extend(reducer.reduce(retried)?);
        }
        Ok((reducer.reduce(partials)?, changed))
    }
}

fn write_op(
    processor: Arc<dyn EntryProcessor>,
    filter: Option<Arc<dyn EntryFilter>>,
) -> EntryOp<Value> {
    entry_op(move |data, ctx, key| {
        transform::write(data, ctx, key, processor.as_ref(), filter.as_deref())
    })
}

fn select_op(filter: Arc<dyn EntryFilter>) -> EntryOp<Value> {
    entry_op(move |data, ctx, key| {
        Ok(match transform::filter_validate(data, ctx, key, filter.as_ref())? {
            ProcessorResult::Blocked(version) => ProcessorResult::Blocked(version),
            ProcessorResult::Done { result, changed } => ProcessorResult::Done {
                result: result.map(|(_, value)| value),
                changed,
            },
        })
    })
}
