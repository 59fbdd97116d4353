use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical key within a cache. Stable across all of its versions.
pub type Key = String;
/// Raw value payload stored per version.
pub type Value = Vec<u8>;
/// Name of a logical cache (a key space sharing one partition layout).
pub type CacheName = String;
/// Identifier of a storage node in the cluster.
pub type NodeId = u32;
/// Identifier of a partition of the key space.
pub type PartitionId = u32;

/// Totally ordered logical timestamp identifying a transaction and the
/// position of every version it writes.
///
/// Ordering is lexicographic over `(wall_millis, sequence, node_id)`, which is
/// exactly the field order of the derive.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct TransactionId {
    wall_millis: u64,
    sequence: u32,
    node_id: u32,
}

impl TransactionId {
    /// Oldest possible version. Every real id sorts after it.
    pub const BIG_BANG: TransactionId = TransactionId {
        wall_millis: 0,
        sequence: 0,
        node_id: 0,
    };

    /// Newest possible id, used by readers that want to see everything.
    pub const MAX: TransactionId = TransactionId {
        wall_millis: u64::MAX,
        sequence: u32::MAX,
        node_id: u32::MAX,
    };

    pub const fn new(wall_millis: u64, sequence: u32, node_id: u32) -> Self {
        Self {
            wall_millis,
            sequence,
            node_id,
        }
    }

    pub fn wall_millis(&self) -> u64 {
        self.wall_millis
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.wall_millis, self.sequence, self.node_id)
    }
}

/// Error returned when parsing a [`TransactionId`] from its display form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed transaction id {0:?}, expected <millis>.<seq>@<node>")]
pub struct ParseTransactionIdError(String);

impl FromStr for TransactionId {
    type Err = ParseTransactionIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseTransactionIdError(raw.to_string());
        let (stamp, node) = raw.split_once('@').ok_or_else(malformed)?;
        let (millis, seq) = stamp.split_once('.').ok_or_else(malformed)?;
        Ok(Self {
            wall_millis: millis.parse().map_err(|_| malformed())?,
            sequence: seq.parse().map_err(|_| malformed())?,
            node_id: node.parse().map_err(|_| malformed())?,
        })
    }
}

/// Identifies exactly one immutable version record: a logical key at the
/// timestamp of the transaction that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionedKey<K> {
    pub key: K,
    pub version: TransactionId,
}

impl<K> VersionedKey<K> {
    pub fn new(key: K, version: TransactionId) -> Self {
        Self { key, version }
    }
}

impl<K: fmt::Display> fmt::Display for VersionedKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.version)
    }
}

/// Isolation policies deciding which version a transaction observes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Sees the newest version at or before its id, committed or not.
    ReadUncommitted,
    /// Sees committed versions (and its own writes).
    ReadCommitted,
    /// Like `ReadCommitted`, and records a read marker for every read served.
    #[default]
    RepeatableRead,
    Serializable,
    /// Write-only: never reads prior state, reads are rejected.
    ReadProhibited,
}

impl IsolationLevel {
    /// Whether uncommitted versions written by others must be waited on.
    pub fn committed_only(self) -> bool {
        matches!(
            self,
            IsolationLevel::ReadCommitted
                | IsolationLevel::RepeatableRead
                | IsolationLevel::Serializable
        )
    }

    /// Whether served reads leave a read marker on the key.
    pub fn marks_reads(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    pub fn reads_prohibited(self) -> bool {
        self == IsolationLevel::ReadProhibited
    }
}

/// Ordered set of partitions touched or targeted by an operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionSet(BTreeSet<PartitionId>);

impl PartitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every partition of a layout with `count` partitions.
    pub fn all(count: u32) -> Self {
        Self((0..count).collect())
    }

    pub fn insert(&mut self, partition: PartitionId) -> bool {
        self.0.insert(partition)
    }

    pub fn remove(&mut self, partition: PartitionId) -> bool {
        self.0.remove(&partition)
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        self.0.contains(&partition)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.0.iter().copied()
    }

    pub fn union_with(&mut self, other: &PartitionSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn subtract(&mut self, other: &PartitionSet) {
        self.0.retain(|partition| !other.0.contains(partition));
    }
}

impl FromIterator<PartitionId> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PartitionSet {
    type Item = PartitionId;
    type IntoIter = std::collections::btree_set::IntoIter<PartitionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Stable partition assignment for any hashable identity.
pub fn partition_of<T: Hash + ?Sized>(item: &T, partition_count: u32) -> PartitionId {
    let mut hasher = DefaultHasher::new();
    item.hash(&mut hasher);
    (hasher.finish() % u64::from(partition_count.max(1))) as PartitionId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_order_lexicographically() {
        let a = TransactionId::new(10, 5, 9);
        let b = TransactionId::new(10, 6, 0);
        let c = TransactionId::new(11, 0, 0);
        assert!(TransactionId::BIG_BANG < a);
        assert!(a < b);
        assert!(b < c);
        assert!(c < TransactionId::MAX);
        assert!(TransactionId::new(10, 5, 1) < TransactionId::new(10, 5, 2));
    }

    #[test]
    fn transaction_id_display_round_trips() {
        let id = TransactionId::new(1_700_000_000_123, 42, 3);
        assert_eq!(id.to_string(), "1700000000123.42@3");
        assert_eq!(id.to_string().parse::<TransactionId>().unwrap(), id);
        assert!("12@3".parse::<TransactionId>().is_err());
    }

    #[test]
    fn versioned_keys_group_by_key_then_version() {
        let mut keys = vec![
            VersionedKey::new("b".to_string(), TransactionId::new(1, 0, 0)),
            VersionedKey::new("a".to_string(), TransactionId::new(9, 0, 0)),
            VersionedKey::new("a".to_string(), TransactionId::new(2, 0, 0)),
        ];
        keys.sort();
        let flat: Vec<(&str, u64)> = keys
            .iter()
            .map(|vk| (vk.key.as_str(), vk.version.wall_millis()))
            .collect();
        assert_eq!(flat, vec![("a", 2), ("a", 9), ("b", 1)]);
    }

    #[test]
    fn isolation_flags() {
        assert!(!IsolationLevel::ReadUncommitted.committed_only());
        assert!(IsolationLevel::ReadCommitted.committed_only());
        assert!(!IsolationLevel::ReadCommitted.marks_reads());
        assert!(IsolationLevel::Serializable.marks_reads());
        assert!(IsolationLevel::ReadProhibited.reads_prohibited());
    }

    #[test]
    fn partition_set_operations() {
        let mut set = PartitionSet::all(4);
        set.subtract(&[1, 3].into_iter().collect());
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);
        set.union_with(&[7].into_iter().collect());
        assert!(set.contains(7));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn partition_of_is_stable_and_bounded() {
        let first = partition_of("key-1", 16);
        assert_eq!(first, partition_of("key-1", 16));
        assert!(first < 16);
        assert_eq!(partition_of("anything", 0), 0);
    }
}
