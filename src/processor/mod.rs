//! Entry transforms: the atomic per-key steps that read and mutate versions.
//!
//! User logic plugs in as an [`EntryProcessor`] working on a
//! [`ResolvedEntry`]; whether partial results are reduced is spelled out by
//! the [`Processing`] variant rather than discovered at runtime.

pub mod entry;
pub mod transform;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{Key, Value};

pub use entry::ResolvedEntry;
pub use transform::{ProcessorResult, ScanHit, ScanOutcome, TransformContext, VisibleEntry};

/// Failure raised by user-supplied processing logic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessorError(pub String);

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Logic run against one resolved entry inside a write transform.
///
/// The returned value is the caller-visible result; changes are made through
/// [`ResolvedEntry::set_value`] and [`ResolvedEntry::remove`].
pub trait EntryProcessor: Send + Sync {
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError>;
}

impl<F> EntryProcessor for F
where
    F: Fn(&mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> + Send + Sync,
{
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> {
        self(entry)
    }
}

/// Wrap a closure as a shareable processor.
pub fn processor_fn<F>(f: F) -> Arc<dyn EntryProcessor>
where
    F: Fn(&mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Combines partial results into one.
///
/// A reducer is applied per partition and then again over the partition
/// results, so it must accept its own output as input.
pub trait Reducer: Send + Sync {
    fn reduce(&self, partials: Vec<Value>) -> Result<Option<Value>, ProcessorError>;
}

impl<F> Reducer for F
where
    F: Fn(Vec<Value>) -> Result<Option<Value>, ProcessorError> + Send + Sync,
{
    fn reduce(&self, partials: Vec<Value>) -> Result<Option<Value>, ProcessorError> {
        self(partials)
    }
}

pub fn reducer_fn<F>(f: F) -> Arc<dyn Reducer>
where
    F: Fn(Vec<Value>) -> Result<Option<Value>, ProcessorError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Processing logic for bulk operations, with or without a reduce step.
#[derive(Clone)]
pub enum Processing {
    /// Results are returned per key.
    Plain(Arc<dyn EntryProcessor>),
    /// Results are reduced per partition on the owning node, then once more
    /// by the caller.
    Reducing {
        processor: Arc<dyn EntryProcessor>,
        reducer: Arc<dyn Reducer>,
    },
}

impl Processing {
    pub fn processor(&self) -> &Arc<dyn EntryProcessor> {
        match self {
            Processing::Plain(processor) | Processing::Reducing { processor, .. } => processor,
        }
    }

    pub fn reducer(&self) -> Option<&Arc<dyn Reducer>> {
        match self {
            Processing::Plain(_) => None,
            Processing::Reducing { reducer, .. } => Some(reducer),
        }
    }
}

impl fmt::Debug for Processing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processing::Plain(_) => f.write_str("Processing::Plain"),
            Processing::Reducing { .. } => f.write_str("Processing::Reducing"),
        }
    }
}

/// Predicate over visible entries, used by scans and filtered bulk calls.
pub trait EntryFilter: Send + Sync {
    fn matches(&self, key: &Key, value: &Value) -> bool;
}

impl<F> EntryFilter for F
where
    F: Fn(&Key, &Value) -> bool + Send + Sync,
{
    fn matches(&self, key: &Key, value: &Value) -> bool {
        self(key, value)
    }
}

pub fn filter_fn<F>(f: F) -> Arc<dyn EntryFilter>
where
    F: Fn(&Key, &Value) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Matches every visible entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EntryFilter for AcceptAll {
    fn matches(&self, _key: &Key, _value: &Value) -> bool {
        true
    }
}

/// Matches entries whose value equals the given bytes.
#[derive(Debug, Clone)]
pub struct ValueEquals(pub Value);

impl EntryFilter for ValueEquals {
    fn matches(&self, _key: &Key, value: &Value) -> bool {
        *value == self.0
    }
}

/// Stores a value, returning the previous one.
#[derive(Debug, Clone)]
pub struct PutProcessor(pub Value);

impl EntryProcessor for PutProcessor {
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> {
        let previous = entry.prior_value().cloned();
        entry.set_value(self.0.clone());
        Ok(previous)
    }
}

/// Stores a value only if the key is absent.
#[derive(Debug, Clone)]
pub struct InsertProcessor(pub Value);

impl EntryProcessor for InsertProcessor {
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> {
        if !entry.exists() {
            entry.set_value(self.0.clone());
        }
        Ok(None)
    }
}

/// Deletes the key if present, returning the removed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveProcessor;

impl EntryProcessor for RemoveProcessor {
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> {
        let previous = entry.prior_value().cloned();
        if entry.exists() {
            entry.remove();
        }
        Ok(previous)
    }
}

/// Returns the current value without changing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadValue;

impl EntryProcessor for ReadValue {
    fn process(&self, entry: &mut ResolvedEntry) -> Result<Option<Value>, ProcessorError> {
        Ok(entry.value().cloned())
    }
}
