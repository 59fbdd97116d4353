use crate::mvcc::Payload;
use crate::types::{Key, TransactionId, Value, VersionedKey};

/// The resolved view of one logical key handed to processing logic.
///
/// Carries the prior visible value (when the isolation level allows reading
/// it) and collects at most one pending change, which the write transform
/// turns into a new version.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    key: Key,
    txn: TransactionId,
    prior: Option<Value>,
    prior_version: Option<VersionedKey<Key>>,
    prior_readable: bool,
    pending: Option<Payload<Value>>,
}

impl ResolvedEntry {
    pub(crate) fn new(
        key: Key,
        txn: TransactionId,
        prior: Option<Value>,
        prior_version: Option<VersionedKey<Key>>,
        prior_readable: bool,
    ) -> Self {
        Self {
            key,
            txn,
            prior,
            prior_version,
            prior_readable,
            pending: None,
        }
    }

    /// Entry that was not allowed to look at prior state.
    pub(crate) fn blind(key: Key, txn: TransactionId) -> Self {
        Self::new(key, txn, None, None, false)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn transaction(&self) -> TransactionId {
        self.txn
    }

    /// Current value: the pending change if any, otherwise the prior value.
    pub fn value(&self) -> Option<&Value> {
        match &self.pending {
            Some(payload) => payload.as_value(),
            None => self.prior.as_ref(),
        }
    }

    pub fn exists(&self) -> bool {
        self.value().is_some()
    }

    pub fn prior_value(&self) -> Option<&Value> {
        self.prior.as_ref()
    }

    /// Versioned key the prior value was read from.
    pub fn prior_version(&self) -> Option<&VersionedKey<Key>> {
        self.prior_version.as_ref()
    }

    /// `false` under read-prohibited isolation: prior state was not read.
    pub fn prior_readable(&self) -> bool {
        self.prior_readable
    }

    pub fn set_value(&mut self, value: Value) {
        self.pending = Some(Payload::Value(value));
    }

    pub fn remove(&mut self) {
        self.pending = Some(Payload::Tombstone);
    }

    pub fn is_changed(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn take_change(&mut self) -> Option<Payload<Value>> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_change_overrides_prior() {
        let txn = TransactionId::new(1, 0, 0);
        let mut entry = ResolvedEntry::new(
            "k".into(),
            txn,
            Some(b"old".to_vec()),
            Some(VersionedKey::new("k".into(), TransactionId::BIG_BANG)),
            true,
        );
        assert_eq!(entry.value(), Some(&b"old".to_vec()));
        entry.set_value(b"new".to_vec());
        assert_eq!(entry.value(), Some(&b"new".to_vec()));
        assert_eq!(entry.prior_value(), Some(&b"old".to_vec()));
        entry.remove();
        assert!(!entry.exists());
        assert_eq!(entry.take_change(), Some(Payload::Tombstone));
        assert!(!entry.is_changed());
    }

    #[test]
    fn blind_entry_has_no_prior() {
        let entry = ResolvedEntry::blind("k".into(), TransactionId::new(1, 0, 0));
        assert!(!entry.prior_readable());
        assert!(!entry.exists());
    }
}
