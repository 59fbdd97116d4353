use serde::{Deserialize, Serialize};

/// Logical content of a version: a value, or the marker of a delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload<V> {
    Value(V),
    Tombstone,
}

impl<V> Payload<V> {
    pub fn as_value(&self) -> Option<&V> {
        match self {
            Payload::Value(value) => Some(value),
            Payload::Tombstone => None,
        }
    }
}

/// One immutable version of a logical key.
///
/// `committed` moves from `false` to `true` at most once. A rolled back
/// version is removed from the index instead of being flagged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord<V> {
    pub payload: Payload<V>,
    pub committed: bool,
}

impl<V> VersionRecord<V> {
    pub fn new(payload: Payload<V>, committed: bool) -> Self {
        Self { payload, committed }
    }

    pub fn uncommitted(payload: Payload<V>) -> Self {
        Self::new(payload, false)
    }

    /// Flip the commit decoration. Returns `true` if this call changed it.
    pub fn mark_committed(&mut self) -> bool {
        !std::mem::replace(&mut self.committed, true)
    }
}
