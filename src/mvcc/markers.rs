use std::collections::BTreeSet;
use std::ops::Bound;

use crate::types::TransactionId;

/// Transactions that read a key under a marking isolation level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadMarkerSet {
    readers: BTreeSet<TransactionId>,
}

impl ReadMarkerSet {
    pub fn add(&mut self, reader: TransactionId) -> bool {
        self.readers.insert(reader)
    }

    pub fn contains(&self, reader: &TransactionId) -> bool {
        self.readers.contains(reader)
    }

    /// Smallest recorded reader strictly after `txn`.
    pub fn higher(&self, txn: TransactionId) -> Option<TransactionId> {
        self.readers
            .range((Bound::Excluded(txn), Bound::Unbounded))
            .next()
            .copied()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(millis: u64) -> TransactionId {
        TransactionId::new(millis, 0, 0)
    }

    #[test]
    fn higher_is_strict() {
        let mut markers = ReadMarkerSet::default();
        markers.add(ts(10));
        markers.add(ts(30));
        assert_eq!(markers.higher(ts(5)), Some(ts(10)));
        assert_eq!(markers.higher(ts(10)), Some(ts(30)));
        assert_eq!(markers.higher(ts(30)), None);
    }

    #[test]
    fn add_is_idempotent() {
        let mut markers = ReadMarkerSet::default();
        assert!(markers.add(ts(1)));
        assert!(!markers.add(ts(1)));
        assert_eq!(markers.len(), 1);
    }
}
