//! Atomic per-key transforms.
//!
//! Each function here runs inside one substrate transform, so it sees the
//! partition exclusively. None of them wait: an uncommitted version owned by
//! someone else comes back as [`ProcessorResult::Blocked`] and the caller
//! decides how to wait.

use crate::error::MvccError;
use crate::mvcc::{Resolution, VersionRecord};
use crate::substrate::{ChangeEvent, PartitionData};
use crate::transaction::TransactionMetadata;
use crate::types::{CacheName, Key, TransactionId, Value, VersionedKey};

use super::entry::ResolvedEntry;
use super::{EntryFilter, EntryProcessor};

/// Result contract shared by every transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorResult<K, R> {
    /// Retry once this version commits or rolls back.
    Blocked(VersionedKey<K>),
    /// `result` is `None` when the transform produced no caller-visible
    /// value; `changed` lists the entries that now carry a version of the
    /// transaction and must be swept at commit or rollback.
    Done {
        result: Option<R>,
        changed: Vec<(CacheName, K)>,
    },
}

impl<K, R> ProcessorResult<K, R> {
    pub fn done(result: Option<R>) -> Self {
        ProcessorResult::Done {
            result,
            changed: Vec::new(),
        }
    }
}

/// Who is running a transform and against which cache.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub cache: CacheName,
    pub meta: TransactionMetadata,
}

impl TransformContext {
    pub fn new(cache: impl Into<CacheName>, meta: TransactionMetadata) -> Self {
        Self {
            cache: cache.into(),
            meta,
        }
    }

    pub fn txn(&self) -> TransactionId {
        self.meta.id
    }
}

/// A visible version together with its value.
pub type VisibleEntry = (VersionedKey<Key>, Value);

fn resolve(data: &PartitionData, ctx: &TransformContext, key: &Key) -> Resolution<Key, Value> {
    match data.cache(&ctx.cache) {
        Some(store) => store.visible_version(key, ctx.meta.id, ctx.meta.isolation),
        None => Resolution::Absent { version: None },
    }
}

fn mark_read(data: &mut PartitionData, ctx: &TransformContext, key: &Key) {
    if ctx.meta.isolation.marks_reads() {
        data.cache_mut(&ctx.cache).add_read_marker(key, ctx.meta.id);
    }
}

fn ensure_readable(ctx: &TransformContext) -> Result<(), MvccError> {
    if ctx.meta.isolation.reads_prohibited() {
        return Err(MvccError::ReadProhibited(ctx.meta.id));
    }
    Ok(())
}

/// Resolve the visible version and leave a read marker where the isolation
/// level asks for one. Echoes the visible version so callers can aggregate
/// directly against it.
pub fn read_mark(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
) -> Result<ProcessorResult<Key, VisibleEntry>, MvccError> {
    ensure_readable(ctx)?;
    let visible = match resolve(data, ctx, key) {
        Resolution::Blocked(version) => return Ok(ProcessorResult::Blocked(version)),
        Resolution::Absent { .. } => None,
        Resolution::Present { version, value, .. } => Some((version, value)),
    };
    mark_read(data, ctx, key);
    Ok(ProcessorResult::done(visible))
}

/// Plain read of the visible value.
pub fn read(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
) -> Result<ProcessorResult<Key, Value>, MvccError> {
    Ok(match read_mark(data, ctx, key)? {
        ProcessorResult::Blocked(version) => ProcessorResult::Blocked(version),
        ProcessorResult::Done { result, changed } => ProcessorResult::Done {
            result: result.map(|(_, value)| value),
            changed,
        },
    })
}

pub fn exists(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
) -> Result<ProcessorResult<Key, bool>, MvccError> {
    Ok(match read_mark(data, ctx, key)? {
        ProcessorResult::Blocked(version) => ProcessorResult::Blocked(version),
        ProcessorResult::Done { result, .. } => ProcessorResult::done(Some(result.is_some())),
    })
}

pub fn contains_value(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
    expected: &Value,
) -> Result<ProcessorResult<Key, bool>, MvccError> {
    Ok(match read_mark(data, ctx, key)? {
        ProcessorResult::Blocked(version) => ProcessorResult::Blocked(version),
        ProcessorResult::Done { result, .. } => {
            let matched = result.is_some_and(|(_, value)| value == *expected);
            ProcessorResult::done(Some(matched))
        }
    })
}

/// Re-check a scan candidate: the visible version is returned only if it
/// exists and still satisfies `filter`.
pub fn filter_validate(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
    filter: &dyn EntryFilter,
) -> Result<ProcessorResult<Key, VisibleEntry>, MvccError> {
    Ok(match read_mark(data, ctx, key)? {
        ProcessorResult::Blocked(version) => ProcessorResult::Blocked(version),
        ProcessorResult::Done { result, .. } => ProcessorResult::done(
            result.filter(|(_, value)| filter.matches(key, value)),
        ),
    })
}

/// Run `processor` against `key` and store whatever change it makes as a
/// new version of the transaction.
///
/// Nothing is applied when the prior version is blocked, when the processor
/// fails, or when the change would conflict with a future read.
pub fn write(
    data: &mut PartitionData,
    ctx: &TransformContext,
    key: &Key,
    processor: &dyn EntryProcessor,
    filter: Option<&dyn EntryFilter>,
) -> Result<ProcessorResult<Key, Value>, MvccError> {
    let txn = ctx.meta.id;
    let mut entry = if ctx.meta.isolation.reads_prohibited() {
        ResolvedEntry::blind(key.clone(), txn)
    } else {
        match resolve(data, ctx, key) {
            Resolution::Blocked(version) => return Ok(ProcessorResult::Blocked(version)),
            Resolution::Absent { version } => {
                ResolvedEntry::new(key.clone(), txn, None, version, true)
            }
            Resolution::Present { version, value, .. } => {
                ResolvedEntry::new(key.clone(), txn, Some(value), Some(version), true)
            }
        }
    };

    if let Some(filter) = filter {
        let matched = entry
            .prior_value()
            .is_some_and(|value| filter.matches(key, value));
        if !matched {
            if entry.prior_readable() {
                mark_read(data, ctx, key);
            }
            return Ok(ProcessorResult::done(None));
        }
    }

    let result = processor.process(&mut entry)?;
    let read_prior = entry.prior_readable();

    let Some(payload) = entry.take_change() else {
        if read_prior {
            mark_read(data, ctx, key);
        }
        return Ok(ProcessorResult::done(result));
    };

    let store = data.cache_mut(&ctx.cache);
    store.conflict_check(key, txn)?;
    store.insert_version(
        VersionedKey::new(key.clone(), txn),
        VersionRecord::new(payload, ctx.meta.auto_commit),
    );
    if read_prior {
        mark_read(data, ctx, key);
    }

    let changed = if ctx.meta.auto_commit {
        Vec::new()
    } else {
        vec![(ctx.cache.clone(), key.clone())]
    };
    Ok(ProcessorResult::Done { result, changed })
}

/// Flip one version to committed. Idempotent.
pub fn commit_mark(data: &mut PartitionData, cache: &str, version: &VersionedKey<Key>) -> bool {
    let changed = data.cache_mut(cache).commit_version(version);
    if changed {
        data.emit(ChangeEvent::VersionCommitted {
            cache: cache.to_string(),
            version: version.clone(),
        });
    }
    changed
}

/// Physically remove one uncommitted version. Idempotent.
pub fn rollback_mark(data: &mut PartitionData, cache: &str, version: &VersionedKey<Key>) -> bool {
    let removed = data.cache_mut(cache).rollback_version(version);
    if removed {
        data.emit(ChangeEvent::VersionRemoved {
            cache: cache.to_string(),
            version: version.clone(),
        });
    }
    removed
}

/// Commit every version `txn` wrote to `cache` in this partition.
pub fn commit_all(data: &mut PartitionData, cache: &str, txn: TransactionId) -> usize {
    let written = match data.cache(cache) {
        Some(store) => store.written_by(txn),
        None => return 0,
    };
    written
        .iter()
        .filter(|version| commit_mark(data, cache, version))
        .count()
}

/// Remove every uncommitted version `txn` wrote to `cache` in this partition.
pub fn rollback_all(data: &mut PartitionData, cache: &str, txn: TransactionId) -> usize {
    let written = match data.cache(cache) {
        Some(store) => store.written_by(txn),
        None => return 0,
    };
    written
        .iter()
        .filter(|version| rollback_mark(data, cache, version))
        .count()
}

/// Whether `version` has resolved: committed, or gone after a rollback.
pub fn is_resolved(data: &PartitionData, cache: &str, version: &VersionedKey<Key>) -> bool {
    data.cache(cache)
        .and_then(|store| store.version(version))
        .is_none_or(|record| record.committed)
}

/// One completed entry of a partition scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHit<R> {
    pub key: Key,
    pub result: R,
}

/// Everything a scan over one partition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome<R> {
    pub hits: Vec<ScanHit<R>>,
    /// Keys that could not be processed yet, with the version they wait on.
    pub blocked: Vec<(Key, VersionedKey<Key>)>,
    pub changed: Vec<(CacheName, Key)>,
}

impl<R> Default for ScanOutcome<R> {
    fn default() -> Self {
        Self {
            hits: Vec::new(),
            blocked: Vec::new(),
            changed: Vec::new(),
        }
    }
}

/// Apply `per_key` to every logical key of the context's cache in this
/// partition. A logical error stops the scan and is returned as is.
pub fn scan<R, F>(
    data: &mut PartitionData,
    ctx: &TransformContext,
    per_key: F,
) -> Result<ScanOutcome<R>, MvccError>
where
    F: FnMut(&mut PartitionData, &Key) -> Result<ProcessorResult<Key, R>, MvccError>,
{
    let keys = match data.cache(&ctx.cache) {
        Some(store) => store.logical_keys(),
        None => return Ok(ScanOutcome::default()),
    };
    scan_keys(data, &keys, per_key)
}

/// Apply `per_key` to the given keys of this partition.
pub fn scan_keys<R, F>(
    data: &mut PartitionData,
    keys: &[Key],
    mut per_key: F,
) -> Result<ScanOutcome<R>, MvccError>
where
    F: FnMut(&mut PartitionData, &Key) -> Result<ProcessorResult<Key, R>, MvccError>,
{
    let mut outcome = ScanOutcome::default();
    for key in keys {
        match per_key(data, key)? {
            ProcessorResult::Blocked(version) => outcome.blocked.push((key.clone(), version)),
            ProcessorResult::Done { result, changed } => {
                outcome.changed.extend(changed);
                if let Some(result) = result {
                    outcome.hits.push(ScanHit {
                        key: key.clone(),
                        result,
                    });
                }
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{AcceptAll, InsertProcessor, PutProcessor, RemoveProcessor, ValueEquals};
    use crate::processor::{ProcessorError, processor_fn};
    use crate::types::IsolationLevel;

    fn ts(millis: u64) -> TransactionId {
        TransactionId::new(millis, 0, 0)
    }

    fn ctx(millis: u64, isolation: IsolationLevel, auto_commit: bool) -> TransformContext {
        TransformContext::new(
            "orders",
            TransactionMetadata::new(ts(millis), isolation, auto_commit),
        )
    }

    fn key(raw: &str) -> Key {
        raw.to_string()
    }

    fn put(data: &mut PartitionData, ctx: &TransformContext, k: &str, value: &[u8]) {
        let outcome = write(data, ctx, &key(k), &PutProcessor(value.to_vec()), None).unwrap();
        assert!(matches!(outcome, ProcessorResult::Done { .. }));
    }

    #[test]
    fn read_marks_only_for_marking_levels() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::ReadCommitted, true), "a", b"1");

        read(&mut data, &ctx(5, IsolationLevel::ReadCommitted, false), &key("a")).unwrap();
        assert!(data.cache("orders").unwrap().read_markers(&key("a")).is_none());

        let result = read(&mut data, &ctx(6, IsolationLevel::RepeatableRead, false), &key("a"));
        assert_eq!(result.unwrap(), ProcessorResult::done(Some(b"1".to_vec())));
        let markers = data.cache("orders").unwrap().read_markers(&key("a")).unwrap();
        assert!(markers.contains(&ts(6)));
    }

    #[test]
    fn blocked_write_applies_nothing() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, false), "a", b"1");

        let outcome = write(
            &mut data,
            &ctx(2, IsolationLevel::RepeatableRead, false),
            &key("a"),
            &PutProcessor(b"2".to_vec()),
            None,
        )
        .unwrap();
        assert_eq!(
            outcome,
            ProcessorResult::Blocked(VersionedKey::new(key("a"), ts(1)))
        );
        assert_eq!(data.cache("orders").unwrap().versions().len(), 1);
    }

    #[test]
    fn write_reports_changed_key_unless_autocommit() {
        let mut data = PartitionData::default();
        let outcome = write(
            &mut data,
            &ctx(3, IsolationLevel::RepeatableRead, false),
            &key("a"),
            &PutProcessor(b"x".to_vec()),
            None,
        )
        .unwrap();
        assert_eq!(
            outcome,
            ProcessorResult::Done {
                result: None,
                changed: vec![("orders".to_string(), key("a"))],
            }
        );

        let auto = write(
            &mut data,
            &ctx(4, IsolationLevel::ReadUncommitted, true),
            &key("b"),
            &PutProcessor(b"y".to_vec()),
            None,
        )
        .unwrap();
        assert_eq!(auto, ProcessorResult::done(None));
        let record = data
            .cache("orders")
            .unwrap()
            .version(&VersionedKey::new(key("b"), ts(4)))
            .unwrap();
        assert!(record.committed);
    }

    #[test]
    fn conflicting_write_is_rejected() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, true), "a", b"1");
        read(&mut data, &ctx(30, IsolationLevel::Serializable, false), &key("a")).unwrap();

        let err = write(
            &mut data,
            &ctx(20, IsolationLevel::RepeatableRead, false),
            &key("a"),
            &PutProcessor(b"late".to_vec()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MvccError::FutureRead { reader, .. } if reader == ts(30)));
        assert!(
            data.cache("orders")
                .unwrap()
                .version(&VersionedKey::new(key("a"), ts(20)))
                .is_none()
        );
    }

    #[test]
    fn filtered_out_write_still_marks_the_read() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, true), "a", b"5");

        let outcome = write(
            &mut data,
            &ctx(50, IsolationLevel::Serializable, false),
            &key("a"),
            &PutProcessor(b"0".to_vec()),
            Some(&ValueEquals(b"4".to_vec())),
        )
        .unwrap();
        assert_eq!(outcome, ProcessorResult::done(None));
        let store = data.cache("orders").unwrap();
        assert!(store.read_markers(&key("a")).unwrap().contains(&ts(50)));
        assert_eq!(store.versions().len(), 1);
    }

    #[test]
    fn insert_and_remove_semantics() {
        let mut data = PartitionData::default();
        let writer = ctx(1, IsolationLevel::RepeatableRead, true);
        write(&mut data, &writer, &key("a"), &InsertProcessor(b"1".to_vec()), None).unwrap();
        let second = ctx(2, IsolationLevel::RepeatableRead, true);
        let outcome =
            write(&mut data, &second, &key("a"), &InsertProcessor(b"2".to_vec()), None).unwrap();
        assert_eq!(outcome, ProcessorResult::done(None));
        assert_eq!(data.cache("orders").unwrap().versions().len(), 1);

        let removed = write(&mut data, &second, &key("a"), &RemoveProcessor, None).unwrap();
        assert_eq!(removed, ProcessorResult::done(Some(b"1".to_vec())));
        let after = read(&mut data, &ctx(3, IsolationLevel::ReadCommitted, false), &key("a"));
        assert_eq!(after.unwrap(), ProcessorResult::done(None));
    }

    #[test]
    fn read_prohibited_writes_blind_and_rejects_reads() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, false), "a", b"1");

        let blind = ctx(2, IsolationLevel::ReadProhibited, false);
        let outcome = write(&mut data, &blind, &key("a"), &PutProcessor(b"2".to_vec()), None);
        assert_eq!(
            outcome.unwrap(),
            ProcessorResult::Done {
                result: None,
                changed: vec![("orders".to_string(), key("a"))],
            }
        );
        assert!(matches!(
            read(&mut data, &blind, &key("a")),
            Err(MvccError::ReadProhibited(_))
        ));
    }

    #[test]
    fn processor_error_applies_nothing() {
        let mut data = PartitionData::default();
        let failing = processor_fn(|entry: &mut ResolvedEntry| {
            entry.set_value(b"half".to_vec());
            Err(ProcessorError::new("boom"))
        });
        let err = write(
            &mut data,
            &ctx(1, IsolationLevel::RepeatableRead, false),
            &key("a"),
            failing.as_ref(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MvccError::Processor(_)));
        assert!(data.cache("orders").is_none_or(|store| store.versions().is_empty()));
    }

    #[test]
    fn commit_and_rollback_marking_emit_events_once() {
        let mut data = PartitionData::default();
        let writer = ctx(7, IsolationLevel::RepeatableRead, false);
        put(&mut data, &writer, "a", b"1");
        put(&mut data, &writer, "b", b"2");
        let a = VersionedKey::new(key("a"), ts(7));

        assert!(!is_resolved(&data, "orders", &a));
        assert!(commit_mark(&mut data, "orders", &a));
        assert!(!commit_mark(&mut data, "orders", &a));
        assert!(is_resolved(&data, "orders", &a));
        assert_eq!(rollback_all(&mut data, "orders", ts(7)), 1);
        assert_eq!(data.take_events().len(), 2);
        assert!(is_resolved(&data, "orders", &VersionedKey::new(key("b"), ts(7))));
    }

    #[test]
    fn scan_collects_hits_blocked_and_changes() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, true), "a", b"1");
        put(&mut data, &ctx(2, IsolationLevel::RepeatableRead, false), "b", b"2");
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, true), "c", b"3");

        let scanner = ctx(5, IsolationLevel::RepeatableRead, false);
        let outcome = scan(&mut data, &scanner, |data, key| {
            write(
                data,
                &scanner,
                key,
                &PutProcessor(b"0".to_vec()),
                Some(&ValueEquals(b"1".to_vec())),
            )
        })
        .unwrap();

        assert_eq!(outcome.blocked, vec![(key("b"), VersionedKey::new(key("b"), ts(2)))]);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.changed, vec![("orders".to_string(), key("a"))]);

        let selected = scan(&mut data, &scanner, |data, key| {
            filter_validate(data, &scanner, key, &AcceptAll)
        })
        .unwrap();
        assert_eq!(selected.hits.len(), 2);
    }

    #[test]
    fn contains_value_and_exists() {
        let mut data = PartitionData::default();
        put(&mut data, &ctx(1, IsolationLevel::RepeatableRead, true), "a", b"1");
        let reader = ctx(2, IsolationLevel::ReadCommitted, false);
        assert_eq!(
            exists(&mut data, &reader, &key("a")).unwrap(),
            ProcessorResult::done(Some(true))
        );
        assert_eq!(
            exists(&mut data, &reader, &key("zz")).unwrap(),
            ProcessorResult::done(Some(false))
        );
        assert_eq!(
            contains_value(&mut data, &reader, &key("a"), &b"1".to_vec()).unwrap(),
            ProcessorResult::done(Some(true))
        );
    }
}
