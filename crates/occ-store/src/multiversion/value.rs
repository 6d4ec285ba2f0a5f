//! Versioned value chain for a single key.
//!
//! Every key touched during a block owns one [`VersionedValueChain`]: the
//! history of writes to that key ordered by transaction index. Most keys are
//! written by one to three transactions, so the chain is a sorted vector with
//! an append fast path rather than a tree.

use crate::multiversion::types::{Incarnation, TxnIndex, Version};
use bytes::Bytes;
use parking_lot::RwLock;

/// What a transaction left behind for a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryValue {
    /// A write of an executed transaction.
    Value(Bytes),
    /// A delete of an executed transaction.
    Deleted,
    /// Placeholder for a transaction whose write is pending; readers must abort.
    Estimate,
}

/// One write record in a [`VersionedValueChain`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedEntry {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
    pub value: EntryValue,
}

impl VersionedEntry {
    pub fn version(&self) -> Version {
        Version::new(self.txn_idx, self.incarnation)
    }

    pub fn is_estimate(&self) -> bool {
        matches!(self.value, EntryValue::Estimate)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.value, EntryValue::Deleted)
    }

    /// The written bytes, or `None` for deletes and estimates.
    pub fn value(&self) -> Option<&Bytes> {
        match &self.value {
            EntryValue::Value(value) => Some(value),
            EntryValue::Deleted | EntryValue::Estimate => None,
        }
    }
}

/// Ordered write history of one key, guarded by its own lock.
///
/// Invariant: at most one entry per transaction index, entries sorted by index.
#[derive(Debug, Default)]
pub struct VersionedValueChain {
    entries: RwLock<Vec<VersionedEntry>>,
}

impl VersionedValueChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value written at `txn_idx`.
    pub fn set(&self, txn_idx: TxnIndex, incarnation: Incarnation, value: Bytes) {
        self.insert(VersionedEntry {
            txn_idx,
            incarnation,
            value: EntryValue::Value(value),
        });
    }

    /// Insert or replace a delete marker at `txn_idx`.
    pub fn delete(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        self.insert(VersionedEntry {
            txn_idx,
            incarnation,
            value: EntryValue::Deleted,
        });
    }

    /// Insert or replace an estimate at `txn_idx`.
    pub fn set_estimate(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        self.insert(VersionedEntry {
            txn_idx,
            incarnation,
            value: EntryValue::Estimate,
        });
    }

    /// Drop the entry written at `txn_idx`, if any.
    pub fn remove(&self, txn_idx: TxnIndex) {
        let mut entries = self.entries.write();
        if let Ok(pos) = entries.binary_search_by_key(&txn_idx, |entry| entry.txn_idx) {
            entries.remove(pos);
        }
    }

    /// Entry with the greatest index.
    pub fn latest(&self) -> Option<VersionedEntry> {
        self.entries.read().last().cloned()
    }

    /// Entry with the greatest index that is not an estimate.
    pub fn latest_non_estimate(&self) -> Option<VersionedEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|entry| !entry.is_estimate())
            .cloned()
    }

    /// Entry with the greatest index strictly below `txn_idx`.
    ///
    /// A transaction must only ever observe writes of lower-indexed
    /// transactions, no matter in which order they actually executed.
    pub fn latest_before_index(&self, txn_idx: TxnIndex) -> Option<VersionedEntry> {
        let entries = self.entries.read();
        let pos = entries.partition_point(|entry| entry.txn_idx < txn_idx);
        pos.checked_sub(1).map(|pos| entries[pos].clone())
    }

    /// True if any transaction strictly below `txn_idx` left an entry.
    pub fn has_entry_before(&self, txn_idx: TxnIndex) -> bool {
        self.entries
            .read()
            .first()
            .is_some_and(|entry| entry.txn_idx < txn_idx)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn insert(&self, entry: VersionedEntry) {
        let mut entries = self.entries.write();
        // common case: the newest writer is the highest index seen so far
        if entries.last().is_none_or(|last| last.txn_idx < entry.txn_idx) {
            entries.push(entry);
            return;
        }
        match entries.binary_search_by_key(&entry.txn_idx, |existing| existing.txn_idx) {
            Ok(pos) => entries[pos] = entry,
            Err(pos) => entries.insert(pos, entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn value(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_empty_chain() {
        let chain = VersionedValueChain::new();
        assert!(chain.is_empty());
        assert!(chain.latest().is_none());
        assert!(chain.latest_non_estimate().is_none());
        assert!(chain.latest_before_index(10).is_none());
    }

    #[test]
    fn test_latest_and_remove() {
        let chain = VersionedValueChain::new();
        chain.set(1, 0, value("one"));
        chain.set(2, 0, value("two"));
        assert_eq!(chain.latest().unwrap().value(), Some(&value("two")));

        chain.remove(2);
        let latest = chain.latest().unwrap();
        assert_eq!(latest.txn_idx, 1);
        assert_eq!(latest.value(), Some(&value("one")));

        // removing an index that was never written is a no-op
        chain.remove(7);
        assert_eq!(chain.latest().unwrap().txn_idx, 1);
    }

    #[test]
    fn test_out_of_order_inserts_stay_sorted() {
        let chain = VersionedValueChain::new();
        chain.set(5, 0, value("five"));
        chain.set(1, 0, value("one"));
        chain.set(3, 0, value("three"));

        assert_eq!(chain.latest_before_index(2).unwrap().txn_idx, 1);
        assert_eq!(chain.latest_before_index(4).unwrap().txn_idx, 3);
        assert_eq!(chain.latest_before_index(5).unwrap().txn_idx, 3);
        assert_eq!(chain.latest_before_index(6).unwrap().txn_idx, 5);
        assert!(chain.latest_before_index(1).is_none());
        assert!(chain.latest_before_index(0).is_none());
    }

    #[test]
    fn test_same_index_replaces() {
        let chain = VersionedValueChain::new();
        chain.set(2, 0, value("first"));
        chain.set(4, 0, value("other"));
        chain.set(2, 1, value("second"));

        let entry = chain.latest_before_index(3).unwrap();
        assert_eq!(entry.version(), Version::new(2, 1));
        assert_eq!(entry.value(), Some(&value("second")));
        chain.remove(2);
        assert!(chain.latest_before_index(3).is_none());
    }

    #[test]
    fn test_delete_marker() {
        let chain = VersionedValueChain::new();
        chain.set(1, 0, value("one"));
        chain.delete(3, 0);

        let entry = chain.latest_before_index(4).unwrap();
        assert!(entry.is_deleted());
        assert!(!entry.is_estimate());
        assert_eq!(entry.value(), None);
    }

    #[test]
    fn test_estimate_skipped_by_latest_non_estimate() {
        let chain = VersionedValueChain::new();
        chain.set_estimate(1, 0);
        assert!(chain.latest().unwrap().is_estimate());
        assert!(chain.latest_non_estimate().is_none());

        chain.set(0, 0, value("zero"));
        chain.set_estimate(2, 0);
        assert!(chain.latest_before_index(3).unwrap().is_estimate());
        let real = chain.latest_non_estimate().unwrap();
        assert_eq!(real.txn_idx, 0);
        assert_eq!(real.value(), Some(&value("zero")));
    }

    #[test]
    fn test_has_entry_before() {
        let chain = VersionedValueChain::new();
        chain.set(3, 0, value("three"));
        assert!(!chain.has_entry_before(3));
        assert!(chain.has_entry_before(4));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn latest_before_index_is_greatest_lower_write(
            writes in proptest::collection::vec((0u32..48, any::<u8>()), 0..32),
            query in 0u32..56,
        ) {
            let chain = VersionedValueChain::new();
            let mut expected = BTreeMap::new();
            for &(txn_idx, byte) in &writes {
                chain.set(txn_idx, 0, Bytes::from(vec![byte]));
                expected.insert(txn_idx, byte);
            }

            let actual = chain
                .latest_before_index(query)
                .map(|entry| (entry.txn_idx, entry.value().cloned()));
            let wanted = expected
                .range(..query)
                .next_back()
                .map(|(&txn_idx, &byte)| (txn_idx, Some(Bytes::from(vec![byte]))));
            prop_assert_eq!(actual, wanted);
        }

        #[test]
        fn remove_erases_exactly_one_entry(
            indices in proptest::collection::btree_set(0u32..48, 1..16),
            pick in any::<prop::sample::Index>(),
        ) {
            let indices: Vec<_> = indices.into_iter().collect();
            let chain = VersionedValueChain::new();
            for &txn_idx in indices.iter().rev() {
                chain.delete(txn_idx, 0);
            }

            let removed = *pick.get(&indices);
            chain.remove(removed);
            for &txn_idx in &indices {
                let entry = chain.latest_before_index(txn_idx + 1);
                if txn_idx == removed {
                    prop_assert!(entry.is_none_or(|entry| entry.txn_idx < removed));
                } else {
                    prop_assert_eq!(entry.map(|entry| entry.txn_idx), Some(txn_idx));
                }
            }
        }
    }
}
