use std::collections::BTreeMap;
use std::collections::btree_map::Range;
use std::ops::Bound;

use crate::types::{TransactionId, VersionedKey};

use super::version::VersionRecord;

/// Version records of every logical key, ordered by `(key, version)`.
///
/// Because the composite key sorts each logical key's versions together,
/// floor and ceiling are single range lookups and the index needs no upkeep
/// beyond inserting and removing records.
#[derive(Debug, Clone)]
pub struct VersionIndex<K, V> {
    records: BTreeMap<VersionedKey<K>, VersionRecord<V>>,
}

impl<K, V> Default for VersionIndex<K, V> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V> VersionIndex<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaced at the same versioned key.
    pub fn insert(
        &mut self,
        key: VersionedKey<K>,
        record: VersionRecord<V>,
    ) -> Option<VersionRecord<V>> {
        self.records.insert(key, record)
    }

    pub fn remove(&mut self, key: &VersionedKey<K>) -> Option<VersionRecord<V>> {
        self.records.remove(key)
    }

    pub fn get(&self, key: &VersionedKey<K>) -> Option<&VersionRecord<V>> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &VersionedKey<K>) -> Option<&mut VersionRecord<V>> {
        self.records.get_mut(key)
    }

    /// Greatest version of `key` at or before `txn`.
    pub fn floor(
        &self,
        key: &K,
        txn: TransactionId,
    ) -> Option<(&VersionedKey<K>, &VersionRecord<V>)> {
        let low = VersionedKey::new(key.clone(), TransactionId::BIG_BANG);
        let high = VersionedKey::new(key.clone(), txn);
        self.records
            .range((Bound::Included(low), Bound::Included(high)))
            .next_back()
    }

    /// Smallest version of `key` strictly after `txn`.
    pub fn ceiling(
        &self,
        key: &K,
        txn: TransactionId,
    ) -> Option<(&VersionedKey<K>, &VersionRecord<V>)> {
        if txn == TransactionId::MAX {
            return None;
        }
        let low = VersionedKey::new(key.clone(), txn);
        let high = VersionedKey::new(key.clone(), TransactionId::MAX);
        self.records
            .range((Bound::Excluded(low), Bound::Included(high)))
            .next()
    }

    /// All versions of one logical key, oldest first.
    pub fn versions_of(&self, key: &K) -> Range<'_, VersionedKey<K>, VersionRecord<V>> {
        let low = VersionedKey::new(key.clone(), TransactionId::BIG_BANG);
        let high = VersionedKey::new(key.clone(), TransactionId::MAX);
        self.records
            .range((Bound::Included(low), Bound::Included(high)))
    }

    /// Distinct logical keys that have at least one version.
    pub fn logical_keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = Vec::new();
        for versioned in self.records.keys() {
            if keys.last() != Some(&versioned.key) {
                keys.push(versioned.key.clone());
            }
        }
        keys
    }

    /// Versioned keys written by `txn`, across every logical key.
    pub fn written_by(&self, txn: TransactionId) -> Vec<VersionedKey<K>> {
        self.records
            .keys()
            .filter(|versioned| versioned.version == txn)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::version::Payload;

    fn ts(millis: u64) -> TransactionId {
        TransactionId::new(millis, 0, 0)
    }

    fn committed(value: &[u8]) -> VersionRecord<Vec<u8>> {
        VersionRecord::new(Payload::Value(value.to_vec()), true)
    }

    fn vk(key: &str, millis: u64) -> VersionedKey<String> {
        VersionedKey::new(key.to_string(), ts(millis))
    }

    #[test]
    fn insert_orders_versions() {
        let mut index = VersionIndex::new();
        index.insert(vk("k", 30), committed(b"third"));
        index.insert(vk("k", 10), committed(b"first"));
        index.insert(vk("k", 20), committed(b"second"));

        let versions: Vec<u64> = index
            .versions_of(&"k".to_string())
            .map(|(key, _)| key.version.wall_millis())
            .collect();
        assert_eq!(versions, vec![10, 20, 30]);
    }

    #[test]
    fn floor_returns_latest_at_or_before() {
        let mut index = VersionIndex::new();
        index.insert(vk("k", 5), committed(b"v1"));
        index.insert(vk("k", 10), committed(b"v2"));
        index.insert(vk("k", 15), committed(b"v3"));
        index.insert(vk("other", 1), committed(b"x"));

        let key = "k".to_string();
        assert!(index.floor(&key, ts(4)).is_none());
        assert_eq!(index.floor(&key, ts(10)).unwrap().0, &vk("k", 10));
        assert_eq!(index.floor(&key, ts(12)).unwrap().0, &vk("k", 10));
        assert_eq!(index.floor(&key, TransactionId::MAX).unwrap().0, &vk("k", 15));
    }

    #[test]
    fn ceiling_is_strictly_after() {
        let mut index = VersionIndex::new();
        index.insert(vk("k", 5), committed(b"v1"));
        index.insert(vk("k", 10), committed(b"v2"));
        index.insert(vk("z", 7), committed(b"z"));

        let key = "k".to_string();
        assert_eq!(index.ceiling(&key, ts(5)).unwrap().0, &vk("k", 10));
        assert_eq!(index.ceiling(&key, ts(1)).unwrap().0, &vk("k", 5));
        assert!(index.ceiling(&key, ts(10)).is_none());
        assert!(index.ceiling(&key, TransactionId::MAX).is_none());
    }

    #[test]
    fn logical_keys_and_writers() {
        let mut index = VersionIndex::new();
        index.insert(vk("a", 1), committed(b"1"));
        index.insert(vk("a", 2), committed(b"2"));
        index.insert(vk("b", 2), committed(b"3"));

        assert_eq!(index.logical_keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(index.written_by(ts(2)), vec![vk("a", 2), vk("b", 2)]);
        assert!(index.remove(&vk("a", 2)).is_some());
        assert_eq!(index.len(), 2);
    }
}
