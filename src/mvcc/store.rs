use std::collections::HashMap;
use std::hash::Hash;

use crate::types::{IsolationLevel, TransactionId, VersionedKey};

use super::index::VersionIndex;
use super::markers::ReadMarkerSet;
use super::version::{Payload, VersionRecord};

/// Outcome of resolving which version of a key a transaction observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<K, V> {
    /// No visible value: the key never existed as of the reader, or the
    /// visible version is a tombstone (`version` is then `Some`).
    Absent { version: Option<VersionedKey<K>> },
    Present {
        version: VersionedKey<K>,
        value: V,
        committed: bool,
    },
    /// An uncommitted version written by another transaction must resolve
    /// before the reader may proceed.
    Blocked(VersionedKey<K>),
}

impl<K, V> Resolution<K, V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Resolution::Present { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Resolution::Blocked(_))
    }
}

/// A write would change what an already served read at a later timestamp saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureReadConflict<K> {
    pub key: K,
    pub writer: TransactionId,
    pub reader: TransactionId,
}

/// Version chains and read markers for every key of one cache partition.
#[derive(Debug, Clone)]
pub struct MvccStore<K, V> {
    versions: VersionIndex<K, V>,
    read_markers: HashMap<K, ReadMarkerSet>,
}

impl<K, V> Default for MvccStore<K, V> {
    fn default() -> Self {
        Self {
            versions: VersionIndex::default(),
            read_markers: HashMap::new(),
        }
    }
}

impl<K, V> MvccStore<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> &VersionIndex<K, V> {
        &self.versions
    }

    pub fn read_markers(&self, key: &K) -> Option<&ReadMarkerSet> {
        self.read_markers.get(key)
    }

    pub fn version(&self, key: &VersionedKey<K>) -> Option<&VersionRecord<V>> {
        self.versions.get(key)
    }

    /// Which version of `key` transaction `txn` sees under `isolation`.
    pub fn visible_version(
        &self,
        key: &K,
        txn: TransactionId,
        isolation: IsolationLevel,
    ) -> Resolution<K, V> {
        let Some((versioned, record)) = self.versions.floor(key, txn) else {
            return Resolution::Absent { version: None };
        };

        let own_write = versioned.version == txn;
        if isolation.committed_only() && !record.committed && !own_write {
            return Resolution::Blocked(versioned.clone());
        }

        match &record.payload {
            Payload::Tombstone => Resolution::Absent {
                version: Some(versioned.clone()),
            },
            Payload::Value(value) => Resolution::Present {
                version: versioned.clone(),
                value: value.clone(),
                committed: record.committed,
            },
        }
    }

    /// Fails if writing `key` at `writer` would retroactively change a read
    /// already served at a later timestamp.
    ///
    /// A later write at or before that read shields it: the reader saw that
    /// write (or waited on it), not the one being made now.
    pub fn conflict_check(
        &self,
        key: &K,
        writer: TransactionId,
    ) -> Result<(), FutureReadConflict<K>> {
        let Some(next_read) = self
            .read_markers
            .get(key)
            .and_then(|markers| markers.higher(writer))
        else {
            return Ok(());
        };

        match self.versions.ceiling(key, writer) {
            Some((next_write, _)) if next_write.version <= next_read => Ok(()),
            _ => Err(FutureReadConflict {
                key: key.clone(),
                writer,
                reader: next_read,
            }),
        }
    }

    pub fn add_read_marker(&mut self, key: &K, reader: TransactionId) -> bool {
        self.read_markers
            .entry(key.clone())
            .or_default()
            .add(reader)
    }

    /// Store a new version. Only the writer's own version at the same
    /// versioned key can be replaced.
    pub fn insert_version(
        &mut self,
        key: VersionedKey<K>,
        record: VersionRecord<V>,
    ) -> Option<VersionRecord<V>> {
        self.versions.insert(key, record)
    }

    /// Returns `true` when the version exists and was not yet committed.
    pub fn commit_version(&mut self, key: &VersionedKey<K>) -> bool {
        self.versions
            .get_mut(key)
            .map(VersionRecord::mark_committed)
            .unwrap_or(false)
    }

    /// Physically removes an uncommitted version. Committed history is
    /// permanent, so committed versions are left in place.
    pub fn rollback_version(&mut self, key: &VersionedKey<K>) -> bool {
        match self.versions.get(key) {
            Some(record) if !record.committed => self.versions.remove(key).is_some(),
            _ => false,
        }
    }

    pub fn logical_keys(&self) -> Vec<K> {
        self.versions.logical_keys()
    }

    pub fn written_by(&self, txn: TransactionId) -> Vec<VersionedKey<K>> {
        self.versions.written_by(txn)
    }
}
