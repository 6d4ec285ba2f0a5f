//! Transaction view over the multi-version store.
//!
//! A [`TransactionView`] is the store one execution attempt runs against. It
//! buffers writes locally, resolves reads through its own writeset, its
//! readset, the multi-version store and finally the parent store, and records
//! everything it observed so the attempt can be validated later.

use crate::{
    Error,
    kv::{BackingStore, KvStore},
    multiversion::{
        iterator::{KeyResolver, MergeIterator},
        store::MultiVersionStore,
        tracker::{IterateSet, IterationTracker},
        types::{Abort, Incarnation, Order, ReadResult, ReadSet, TxnIndex, Version, WriteSet},
    },
};
use bytes::Bytes;
use derive_more::Debug;
use std::sync::mpsc::{SyncSender, TrySendError};
use tracing::{debug, error, instrument, trace, warn};

/// Store seen by one execution attempt `(txn_idx, incarnation)`.
///
/// Writes never reach the [`MultiVersionStore`] until
/// [`TransactionView::write_to_store`] publishes them.
#[derive(Debug)]
pub struct TransactionView<'a, P> {
    txn_idx: TxnIndex,
    incarnation: Incarnation,
    #[debug(skip)]
    store: &'a MultiVersionStore<P>,
    readset: ReadSet,
    writeset: WriteSet,
    iterateset: IterateSet,
    #[debug(skip)]
    abort_tx: SyncSender<Abort>,
    /// First abort raised by this attempt.
    abort: Option<Abort>,
}

impl<'a, P: BackingStore> TransactionView<'a, P> {
    pub(crate) fn new(
        store: &'a MultiVersionStore<P>,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        abort_tx: SyncSender<Abort>,
    ) -> Self {
        Self {
            txn_idx,
            incarnation,
            store,
            readset: ReadSet::new(),
            writeset: WriteSet::new(),
            iterateset: IterateSet::new(),
            abort_tx,
            abort: None,
        }
    }

    pub fn txn_idx(&self) -> TxnIndex {
        self.txn_idx
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn version(&self) -> Version {
        Version::new(self.txn_idx, self.incarnation)
    }

    pub fn readset(&self) -> &ReadSet {
        &self.readset
    }

    pub fn writeset(&self) -> &WriteSet {
        &self.writeset
    }

    pub fn iterateset(&self) -> &IterateSet {
        &self.iterateset
    }

    /// Keys this attempt wrote or deleted, in sorted order.
    pub fn dirty_keys(&self) -> impl Iterator<Item = &Bytes> {
        self.writeset.keys()
    }

    /// The abort raised by this attempt, if it observed an estimate.
    pub fn abort(&self) -> Option<Abort> {
        self.abort
    }

    /// Value of `key` as seen by this attempt.
    ///
    /// Returns [`Error::Aborted`] if a lower transaction has a pending write
    /// for `key`; the abort is also delivered to the scheduler's mailbox.
    #[instrument(
        level = "trace",
        skip_all,
        fields(txn_idx = self.txn_idx, incarnation = self.incarnation)
    )]
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        self.store.config().validate_key(key)?;
        self.resolve(key)
    }

    pub fn has(&mut self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    pub fn set(&mut self, key: Bytes, value: Bytes) -> Result<(), Error> {
        let config = self.store.config();
        config.validate_key(&key)?;
        config.validate_value(&value)?;
        trace!(txn_idx = self.txn_idx, key = ?key, "Buffered write");
        self.writeset.insert(key, Some(value));
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.store.config().validate_key(key)?;
        trace!(txn_idx = self.txn_idx, key = ?key, "Buffered delete");
        self.writeset.insert(Bytes::copy_from_slice(key), None);
        Ok(())
    }

    /// Ascending iteration over `[start, end)`.
    pub fn iterator(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> ViewIterator<'_, 'a, P> {
        self.new_iterator(start, end, Order::Ascending)
    }

    /// Descending iteration over `[start, end)`.
    pub fn reverse_iterator(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> ViewIterator<'_, 'a, P> {
        self.new_iterator(start, end, Order::Descending)
    }

    fn new_iterator(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
    ) -> ViewIterator<'_, 'a, P> {
        let store = self.store;
        // readset keys resolve to their pinned values instead of the parent's
        let candidates = store.iteration_candidates(
            self.txn_idx,
            start,
            end,
            order,
            self.writeset.keys().chain(self.readset.keys()),
        );
        let parent = store.parent().range(start, end, order);

        self.iterateset.push(IterationTracker::new(
            start.map(Bytes::copy_from_slice),
            end.map(Bytes::copy_from_slice),
            order,
            self.writeset.clone(),
        ));
        let tracker = self.iterateset.len() - 1;
        trace!(
            txn_idx = self.txn_idx,
            order = %order,
            candidates = candidates.len(),
            "Created iterator"
        );

        ViewIterator {
            inner: MergeIterator::new(candidates, parent, order, ViewResolver { view: self }),
            tracker,
        }
    }

    /// Every key in `[start, end)` visible to this attempt.
    pub fn keys_in_range(
        &mut self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<Bytes>, Error> {
        self.iterator(start, end)
            .map(|item| item.map(|(key, _)| key))
            .collect()
    }

    /// Delete every key in `[start, end)` visible to this attempt.
    pub fn delete_all(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), Error> {
        for key in self.keys_in_range(start, end)? {
            self.writeset.insert(key, None);
        }
        Ok(())
    }

    fn resolve(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        // writes shadow reads and are not recorded
        if let Some(value) = self.writeset.get(key) {
            return Ok(value.clone());
        }
        if let Some(value) = self.readset.get(key).and_then(|values| values.first()) {
            return Ok(value.clone());
        }
        match self.store.read(key, self.txn_idx) {
            ReadResult::Aborted { txn_idx } => {
                let abort = Abort::estimate(txn_idx);
                self.write_abort(abort);
                Err(Error::Aborted(abort))
            }
            ReadResult::Value { value, version } => {
                trace!(
                    txn_idx = self.txn_idx,
                    key = ?key,
                    version = %version,
                    "Read from multi-version store"
                );
                self.update_readset(key, value.clone());
                Ok(value)
            }
            ReadResult::NotFound => {
                let value = self.store.parent().get(key);
                self.update_readset(key, value.clone());
                Ok(value)
            }
        }
    }

    /// Record an observation of `key`. Distinct observations are all kept.
    fn update_readset(&mut self, key: &[u8], value: Option<Bytes>) {
        match self.readset.get_mut(key) {
            Some(values) => {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            None => {
                self.readset.insert(Bytes::copy_from_slice(key), vec![value]);
            }
        }
    }

    /// Deliver `abort` to the scheduler. Only the first abort of an attempt is sent.
    fn write_abort(&mut self, abort: Abort) {
        if self.abort.is_some() {
            return;
        }
        self.abort = Some(abort);
        match self.abort_tx.try_send(abort) {
            Ok(()) => debug!(
                txn_idx = self.txn_idx,
                incarnation = self.incarnation,
                dependent_txn_idx = abort.dependent_txn_idx,
                "Aborting execution"
            ),
            Err(TrySendError::Full(_)) => warn!(
                txn_idx = self.txn_idx,
                incarnation = self.incarnation,
                dependent_txn_idx = abort.dependent_txn_idx,
                "Abort mailbox full, discarding abort"
            ),
            Err(TrySendError::Disconnected(_)) => debug!(
                txn_idx = self.txn_idx,
                incarnation = self.incarnation,
                "Abort receiver dropped"
            ),
        }
    }

    /// Check every recorded read against the current state, in key order.
    ///
    /// # Panics
    ///
    /// If a value read from the parent store no longer matches it and no
    /// transaction ever wrote the key: the parent was mutated during the block.
    /// A write that was observed and has since been retracted only
    /// invalidates the attempt.
    pub fn validate_readset(&mut self) -> bool {
        let mut keys: Vec<Bytes> = self.readset.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let observed = match self.readset.get(&key).map(Vec::as_slice) {
                Some([observed]) => observed.clone(),
                Some([]) | None => continue,
                Some(_) => return false,
            };
            match self.store.read(&key, self.txn_idx) {
                ReadResult::Aborted { txn_idx } => {
                    self.write_abort(Abort::estimate(txn_idx));
                    return false;
                }
                ReadResult::Value { value, .. } => {
                    if value != observed {
                        trace!(txn_idx = self.txn_idx, key = ?key, "Readset value changed");
                        return false;
                    }
                }
                ReadResult::NotFound => {
                    let current = self.store.parent().get(&key);
                    if current == observed {
                        continue;
                    }
                    if self.store.was_written(&key) {
                        trace!(txn_idx = self.txn_idx, key = ?key, "Observed write retracted");
                        return false;
                    }
                    error!(
                        txn_idx = self.txn_idx,
                        incarnation = self.incarnation,
                        key = ?key,
                        "Parent store changed under a recorded read"
                    );
                    panic!("parent store value changed for a key no transaction wrote");
                }
            }
        }
        true
    }

    /// Publish the writeset, readset and iterate-set of this attempt.
    pub fn write_to_store(self) {
        debug!(
            txn_idx = self.txn_idx,
            incarnation = self.incarnation,
            writes = self.writeset.len(),
            reads = self.readset.len(),
            iterations = self.iterateset.len(),
            "Writing attempt to multi-version store"
        );
        self.store
            .set_writeset(self.txn_idx, self.incarnation, &self.writeset);
        self.store.set_readset(self.txn_idx, self.readset);
        self.store.set_iterateset(self.txn_idx, self.iterateset);
    }

    /// Mark every key of the writeset as pending for dependent transactions.
    pub fn write_estimates_to_store(&self) {
        self.store
            .set_estimated_writeset(self.txn_idx, self.incarnation, &self.writeset);
    }
}

impl<'a, P: BackingStore> KvStore for TransactionView<'a, P> {
    type Iter<'s>
        = ViewIterator<'s, 'a, P>
    where
        Self: 's;

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        TransactionView::get(self, key)
    }

    fn has(&mut self, key: &[u8]) -> Result<bool, Error> {
        TransactionView::has(self, key)
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<(), Error> {
        TransactionView::set(self, key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        TransactionView::delete(self, key)
    }

    fn iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_> {
        TransactionView::iterator(self, start, end)
    }

    fn reverse_iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_> {
        TransactionView::reverse_iterator(self, start, end)
    }
}

/// Resolves iteration candidates exactly like [`TransactionView::get`].
struct ViewResolver<'v, 'a, P> {
    view: &'v mut TransactionView<'a, P>,
}

impl<P: BackingStore> KeyResolver for ViewResolver<'_, '_, P> {
    fn resolve(&mut self, key: &Bytes) -> Result<Option<Bytes>, Error> {
        self.view.resolve(key)
    }

    fn observe_parent(&mut self, key: &Bytes, value: &Bytes) {
        self.view.update_readset(key, Some(value.clone()));
    }
}

/// Iterator over a [`TransactionView`] that records what it yields.
///
/// Yields `Err(Error::Aborted)` at most once, when a pending write of a lower
/// transaction is reached, and nothing after it.
pub struct ViewIterator<'v, 'a, P> {
    inner: MergeIterator<'a, ViewResolver<'v, 'a, P>>,
    tracker: usize,
}

impl<P: BackingStore> Iterator for ViewIterator<'_, '_, P> {
    type Item = Result<(Bytes, Bytes), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next();
        let exhausted = item.is_none() && !self.inner.is_failed();
        let tracker = &mut self.inner.resolver_mut().view.iterateset[self.tracker];
        match &item {
            Some(Ok((key, _))) => tracker.add_key(key.clone()),
            None if exhausted => tracker.mark_exhausted(),
            _ => {}
        }
        item
    }
}
