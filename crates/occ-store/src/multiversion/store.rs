//! Multi-Version Store
//!
//! The MultiVersionStore is the shared structure every execution attempt of a
//! block reads from and publishes into. It maps each storage key to a
//! [`VersionedValueChain`] and keeps the per-transaction bookkeeping the
//! scheduler needs between attempts.
//!
//! # Key Features
//!
//! - **Versioned Storage**: one chain per key, one entry per transaction index
//! - **Estimates**: pending writes that force dependent readers to abort
//! - **Two-level locking**: the key map is only locked to create a chain; each
//!   chain carries its own lock, so disjoint keys never contend
//! - **Validation**: stored readsets and iterate-sets are re-checked against
//!   the current state once lower transactions have settled

use crate::{
    Config, Error,
    kv::{BackingStore, key_range},
    multiversion::{
        iterator::{KeyResolver, MergeIterator},
        tracker::IterateSet,
        types::{Abort, Incarnation, Order, ReadResult, ReadSet, TxnIndex, WriteSet},
        value::{EntryValue, VersionedEntry, VersionedValueChain},
        view::TransactionView,
    },
};
use bytes::Bytes;
use dashmap::DashMap;
use derive_more::Debug;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, mpsc::SyncSender},
};
use tracing::{debug, trace};

/// Versioned state of one block on top of a parent store.
#[derive(Debug)]
pub struct MultiVersionStore<P> {
    /// Map from storage key to its write history.
    data: DashMap<Bytes, Arc<VersionedValueChain>>,
    /// Sorted keys written by the last attempt of each transaction.
    tx_writeset_keys: DashMap<TxnIndex, Vec<Bytes>>,
    tx_readsets: DashMap<TxnIndex, ReadSet>,
    tx_iteratesets: DashMap<TxnIndex, IterateSet>,
    #[debug(skip)]
    parent: P,
    config: Config,
}

impl<P: BackingStore> MultiVersionStore<P> {
    pub fn new(parent: P) -> Self {
        Self::with_config(parent, Config::default())
    }

    pub fn with_config(parent: P, config: Config) -> Self {
        Self {
            data: DashMap::new(),
            tx_writeset_keys: DashMap::new(),
            tx_readsets: DashMap::new(),
            tx_iteratesets: DashMap::new(),
            parent,
            config,
        }
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the view for one execution attempt of `txn_idx`.
    pub fn view(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        abort_tx: SyncSender<Abort>,
    ) -> TransactionView<'_, P> {
        TransactionView::new(self, txn_idx, incarnation, abort_tx)
    }

    fn chain(&self, key: &[u8]) -> Option<Arc<VersionedValueChain>> {
        // clone the Arc so the shard lock is released before the chain is locked
        self.data.get(key).map(|chain| Arc::clone(chain.value()))
    }

    fn chain_or_create(&self, key: &Bytes) -> Arc<VersionedValueChain> {
        if let Some(chain) = self.chain(key) {
            return chain;
        }
        Arc::clone(self.data.entry(key.clone()).or_default().value())
    }

    /// True if any attempt of any transaction ever wrote `key`, even if
    /// that write was retracted since.
    pub(crate) fn was_written(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    /// Entry with the greatest index for `key`.
    pub fn get_latest(&self, key: &[u8]) -> Option<VersionedEntry> {
        self.chain(key)?.latest()
    }

    /// Entry with the greatest index strictly below `txn_idx` for `key`.
    pub fn get_latest_before_index(&self, txn_idx: TxnIndex, key: &[u8]) -> Option<VersionedEntry> {
        self.chain(key)?.latest_before_index(txn_idx)
    }

    /// True if a transaction at or below `txn_idx` left an entry for `key`.
    pub fn has(&self, txn_idx: TxnIndex, key: &[u8]) -> bool {
        match txn_idx.checked_add(1) {
            Some(bound) => self.get_latest_before_index(bound, key).is_some(),
            None => self.get_latest(key).is_some(),
        }
    }

    /// Resolve `key` as seen by `reader_idx`.
    pub fn read(&self, key: &[u8], reader_idx: TxnIndex) -> ReadResult {
        let Some(entry) = self.get_latest_before_index(reader_idx, key) else {
            return ReadResult::NotFound;
        };
        let version = entry.version();
        match entry.value {
            EntryValue::Estimate => ReadResult::Aborted {
                txn_idx: entry.txn_idx,
            },
            EntryValue::Value(value) => ReadResult::Value {
                value: Some(value),
                version,
            },
            EntryValue::Deleted => ReadResult::Value {
                value: None,
                version,
            },
        }
    }

    pub fn set(&self, txn_idx: TxnIndex, incarnation: Incarnation, key: &Bytes, value: Bytes) {
        self.chain_or_create(key).set(txn_idx, incarnation, value);
    }

    pub fn set_estimate(&self, txn_idx: TxnIndex, incarnation: Incarnation, key: &Bytes) {
        self.chain_or_create(key).set_estimate(txn_idx, incarnation);
    }

    pub fn delete(&self, txn_idx: TxnIndex, incarnation: Incarnation, key: &Bytes) {
        self.chain_or_create(key).delete(txn_idx, incarnation);
    }

    /// Retract whatever `txn_idx` wrote for `key`.
    pub fn remove(&self, txn_idx: TxnIndex, key: &[u8]) {
        if let Some(chain) = self.chain(key) {
            chain.remove(txn_idx);
        }
    }

    /// Drop entries of keys the previous attempt wrote that the new writeset no longer touches.
    fn retract_stale_writes(&self, txn_idx: TxnIndex, writeset: &WriteSet) {
        let Some(previous) = self
            .tx_writeset_keys
            .get(&txn_idx)
            .map(|keys| keys.value().clone())
        else {
            return;
        };
        for key in previous.iter().filter(|key| !writeset.contains_key(*key)) {
            trace!(txn_idx = txn_idx, key = ?key, "Retracting stale write");
            self.remove(txn_idx, key);
        }
    }

    /// Publish the writes of an attempt at `(txn_idx, incarnation)`.
    pub fn set_writeset(&self, txn_idx: TxnIndex, incarnation: Incarnation, writeset: &WriteSet) {
        self.retract_stale_writes(txn_idx, writeset);
        for (key, value) in writeset {
            match value {
                Some(value) => self.set(txn_idx, incarnation, key, value.clone()),
                None => self.delete(txn_idx, incarnation, key),
            }
        }
        self.tx_writeset_keys
            .insert(txn_idx, writeset.keys().cloned().collect());
        debug!(
            txn_idx = txn_idx,
            incarnation = incarnation,
            keys = writeset.len(),
            "Applied writeset"
        );
    }

    /// Publish the keys of an attempt at `(txn_idx, incarnation)` as estimates.
    pub fn set_estimated_writeset(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        writeset: &WriteSet,
    ) {
        self.retract_stale_writes(txn_idx, writeset);
        for key in writeset.keys() {
            self.set_estimate(txn_idx, incarnation, key);
        }
        self.tx_writeset_keys
            .insert(txn_idx, writeset.keys().cloned().collect());
        debug!(
            txn_idx = txn_idx,
            incarnation = incarnation,
            keys = writeset.len(),
            "Applied estimated writeset"
        );
    }

    /// Turn every write of the last attempt at `txn_idx` into an estimate.
    pub fn invalidate_writeset(&self, txn_idx: TxnIndex, incarnation: Incarnation) {
        let Some(keys) = self
            .tx_writeset_keys
            .get(&txn_idx)
            .map(|keys| keys.value().clone())
        else {
            return;
        };
        for key in &keys {
            self.set_estimate(txn_idx, incarnation, key);
        }
        debug!(
            txn_idx = txn_idx,
            incarnation = incarnation,
            keys = keys.len(),
            "Invalidated writeset"
        );
    }

    pub fn set_readset(&self, txn_idx: TxnIndex, readset: ReadSet) {
        self.tx_readsets.insert(txn_idx, readset);
    }

    pub fn clear_readset(&self, txn_idx: TxnIndex) {
        self.tx_readsets.remove(&txn_idx);
    }

    pub fn set_iterateset(&self, txn_idx: TxnIndex, iterateset: IterateSet) {
        self.tx_iteratesets.insert(txn_idx, iterateset);
    }

    pub fn clear_iterateset(&self, txn_idx: TxnIndex) {
        self.tx_iteratesets.remove(&txn_idx);
    }

    /// Sorted written keys of every transaction that published a writeset.
    pub fn get_all_writeset_keys(&self) -> BTreeMap<TxnIndex, Vec<Bytes>> {
        self.tx_writeset_keys
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Every key some transaction below `txn_idx` left an entry for.
    pub fn collect_iterator_keys(&self, txn_idx: TxnIndex) -> BTreeSet<Bytes> {
        self.data
            .iter()
            .filter(|entry| entry.value().has_entry_before(txn_idx))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Sorted keys in `[start, end)` an iteration at `txn_idx` has to resolve.
    pub(crate) fn iteration_candidates<'k>(
        &self,
        txn_idx: TxnIndex,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
        local: impl IntoIterator<Item = &'k Bytes>,
    ) -> Vec<Bytes> {
        let Some(bounds) = key_range(start, end) else {
            return Vec::new();
        };
        let mut keys = self.collect_iterator_keys(txn_idx);
        keys.extend(local.into_iter().cloned());
        let range = keys.range::<[u8], _>(bounds).cloned();
        match order {
            Order::Ascending => range.collect(),
            Order::Descending => range.rev().collect(),
        }
    }

    /// Replay every stored iteration of `txn_idx` against the current state.
    fn validate_iterateset(&self, txn_idx: TxnIndex) -> bool {
        let Some(iterateset) = self.tx_iteratesets.get(&txn_idx) else {
            return true;
        };
        for tracker in iterateset.iter() {
            let candidates = self.iteration_candidates(
                txn_idx,
                tracker.start(),
                tracker.end(),
                tracker.order(),
                tracker.writeset().keys(),
            );
            let parent = self
                .parent
                .range(tracker.start(), tracker.end(), tracker.order());
            let resolver = ReplayResolver {
                store: self,
                txn_idx,
                writeset: tracker.writeset(),
            };
            let replay = MergeIterator::new(candidates, parent, tracker.order(), resolver);
            if !tracker.validate(replay) {
                debug!(
                    txn_idx = txn_idx,
                    order = %tracker.order(),
                    iterated = tracker.iterated_keys().len(),
                    "Iteration replay diverged"
                );
                return false;
            }
        }
        true
    }

    /// Check the stored readset of `txn_idx`; returns validity and the conflicting writers.
    fn validate_readset(&self, txn_idx: TxnIndex, conflicts: &mut BTreeSet<TxnIndex>) -> bool {
        let Some(readset) = self.tx_readsets.get(&txn_idx) else {
            return true;
        };
        let mut keys: Vec<&Bytes> = readset.keys().collect();
        keys.sort();

        let mut valid = true;
        for key in keys {
            let observed = &readset[key];
            if observed.len() > 1 {
                trace!(txn_idx = txn_idx, key = ?key, "Key observed with several values");
                valid = false;
                continue;
            }
            let Some(observed) = observed.first() else {
                continue;
            };
            match self.read(key, txn_idx) {
                ReadResult::Aborted { txn_idx: writer } => {
                    conflicts.insert(writer);
                }
                ReadResult::Value { value, version } => {
                    if value != *observed {
                        valid = false;
                        conflicts.insert(version.txn_idx);
                    }
                }
                ReadResult::NotFound => {
                    if self.parent.get(key) != *observed {
                        valid = false;
                    }
                }
            }
        }
        valid
    }

    /// Validate the stored iterate-set and readset of `txn_idx`.
    ///
    /// Returns whether the last attempt is still valid together with the
    /// sorted indices of lower transactions it conflicts with. An estimate
    /// alone reports a conflict without invalidating the attempt.
    pub fn validate_transaction_state(&self, txn_idx: TxnIndex) -> (bool, Vec<TxnIndex>) {
        let iterateset_valid = self.validate_iterateset(txn_idx);
        let mut conflicts = BTreeSet::new();
        let readset_valid = self.validate_readset(txn_idx, &mut conflicts);
        let valid = iterateset_valid && readset_valid;
        if !valid || !conflicts.is_empty() {
            debug!(
                txn_idx = txn_idx,
                valid = valid,
                conflicts = ?conflicts,
                "Transaction state validated"
            );
        }
        (valid, conflicts.into_iter().collect())
    }

    /// Flush the latest settled write of every key into the parent store.
    ///
    /// Keys whose history holds only estimates are left untouched.
    pub fn write_latest_to_store(&self) {
        let mut keys: Vec<Bytes> = self.data.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();

        let mut written = 0usize;
        for key in keys {
            let Some(entry) = self.chain(&key).and_then(|chain| chain.latest_non_estimate()) else {
                continue;
            };
            match entry.value {
                EntryValue::Value(value) => self.parent.set(key, value),
                EntryValue::Deleted => self.parent.delete(&key),
                EntryValue::Estimate => continue,
            }
            written += 1;
        }
        debug!(keys = written, "Flushed latest writes to parent store");
    }
}

/// Resolves candidate keys for an iteration replay. Records nothing.
struct ReplayResolver<'s, P> {
    store: &'s MultiVersionStore<P>,
    txn_idx: TxnIndex,
    writeset: &'s WriteSet,
}

impl<P: BackingStore> KeyResolver for ReplayResolver<'_, P> {
    fn resolve(&mut self, key: &Bytes) -> Result<Option<Bytes>, Error> {
        if let Some(value) = self.writeset.get(key) {
            return Ok(value.clone());
        }
        match self.store.read(key, self.txn_idx) {
            ReadResult::Value { value, .. } => Ok(value),
            ReadResult::Aborted { txn_idx } => Err(Error::Aborted(Abort::estimate(txn_idx))),
            ReadResult::NotFound => Ok(self.store.parent.get(key)),
        }
    }

    fn observe_parent(&mut self, _key: &Bytes, _value: &Bytes) {}
}
