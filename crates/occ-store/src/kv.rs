//! Key-value store contracts.
//!
//! Two traits split the store surface:
//! - [`BackingStore`]: the committed state underneath a block. It is shared
//!   by every worker and treated as read-only while the block executes.
//! - [`KvStore`]: the byte-keyed API module logic runs against. Implemented
//!   by [`MemStore`] for plain sequential execution and by
//!   [`crate::TransactionView`] for speculative execution.
//!
//! A [`crate::TransactionView`] only ever sits on top of a [`BackingStore`]
//! and is not one itself, so a view can never be wrapped by another view or
//! a multi-version store:
//!
//! ```compile_fail
//! use occ_store::{MemStore, MultiVersionStore};
//!
//! let store = MultiVersionStore::new(MemStore::new());
//! let (abort_tx, _abort_rx) = store.config().abort_channel();
//! let view = store.view(0, 0, abort_tx);
//! let _nested = MultiVersionStore::new(view);
//! ```

use crate::{Error, multiversion::types::Order};
use bytes::Bytes;
use parking_lot::RwLock;
use std::{collections::BTreeMap, ops::Bound, sync::Arc};

/// Sorted key-value pairs produced by a range scan.
pub type KvIter<'a> = Box<dyn Iterator<Item = (Bytes, Bytes)> + Send + 'a>;

/// Committed state consumed by the multi-version store.
pub trait BackingStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Bytes>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn set(&self, key: Bytes, value: Bytes);

    fn delete(&self, key: &[u8]);

    /// Pairs with `start <= key < end` in the given order. `None` bounds are open.
    fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, order: Order) -> KvIter<'_>;
}

impl<S: BackingStore + ?Sized> BackingStore for Arc<S> {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> bool {
        (**self).has(key)
    }

    fn set(&self, key: Bytes, value: Bytes) {
        (**self).set(key, value)
    }

    fn delete(&self, key: &[u8]) {
        (**self).delete(key)
    }

    fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, order: Order) -> KvIter<'_> {
        (**self).range(start, end, order)
    }
}

/// Byte-keyed store API exposed to module logic.
pub trait KvStore {
    type Iter<'s>: Iterator<Item = Result<(Bytes, Bytes), Error>>
    where
        Self: 's;

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error>;

    fn has(&mut self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<(), Error>;

    fn delete(&mut self, key: &[u8]) -> Result<(), Error>;

    fn iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_>;

    fn reverse_iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_>;
}

/// Bounds for `start <= key < end`, or `None` if the range is empty.
pub(crate) fn key_range<'k>(
    start: Option<&'k [u8]>,
    end: Option<&'k [u8]>,
) -> Option<(Bound<&'k [u8]>, Bound<&'k [u8]>)> {
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return None;
        }
    }
    Some((
        start.map_or(Bound::Unbounded, Bound::Included),
        end.map_or(Bound::Unbounded, Bound::Excluded),
    ))
}

/// In-memory backing store over a sorted map.
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl<K: Into<Bytes>, V: Into<Bytes>> FromIterator<(K, V)> for MemStore {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let data = iter
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self {
            data: RwLock::new(data),
        }
    }
}

impl BackingStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: Bytes, value: Bytes) {
        self.data.write().insert(key, value);
    }

    fn delete(&self, key: &[u8]) {
        self.data.write().remove(key);
    }

    fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>, order: Order) -> KvIter<'_> {
        let Some(bounds) = key_range(start, end) else {
            return Box::new(std::iter::empty());
        };
        // snapshot so the lock is not held across the caller's iteration
        let data = self.data.read();
        let range = data
            .range::<[u8], _>(bounds)
            .map(|(key, value)| (key.clone(), value.clone()));
        let pairs: Vec<_> = match order {
            Order::Ascending => range.collect(),
            Order::Descending => range.rev().collect(),
        };
        Box::new(pairs.into_iter())
    }
}

impl KvStore for MemStore {
    type Iter<'s>
        = std::iter::Map<KvIter<'s>, fn((Bytes, Bytes)) -> Result<(Bytes, Bytes), Error>>
    where
        Self: 's;

    fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(BackingStore::get(&*self, key))
    }

    fn set(&mut self, key: Bytes, value: Bytes) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        BackingStore::set(&*self, key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        BackingStore::delete(&*self, key);
        Ok(())
    }

    fn iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_> {
        self.range(start, end, Order::Ascending)
            .map(Ok as fn((Bytes, Bytes)) -> Result<(Bytes, Bytes), Error>)
    }

    fn reverse_iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Self::Iter<'_> {
        self.range(start, end, Order::Descending)
            .map(Ok as fn((Bytes, Bytes)) -> Result<(Bytes, Bytes), Error>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemStore {
        [("key1", "value1"), ("key2", "value2"), ("key3", "value3")]
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    fn keys(iter: KvIter<'_>) -> Vec<Bytes> {
        iter.map(|(key, _)| key).collect()
    }

    #[test]
    fn test_get_set_delete() {
        let store = store();
        assert_eq!(
            BackingStore::get(&store, b"key1"),
            Some(Bytes::from_static(b"value1"))
        );
        BackingStore::set(&store, Bytes::from_static(b"key4"), Bytes::from_static(b"value4"));
        assert!(BackingStore::has(&store, b"key4"));
        BackingStore::delete(&store, b"key1");
        assert!(!BackingStore::has(&store, b"key1"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_range_bounds_and_order() {
        let store = store();
        assert_eq!(
            keys(store.range(Some(b"key1".as_slice()), Some(b"key3".as_slice()), Order::Ascending)),
            vec![Bytes::from_static(b"key1"), Bytes::from_static(b"key2")]
        );
        assert_eq!(
            keys(store.range(None, None, Order::Descending)),
            vec![
                Bytes::from_static(b"key3"),
                Bytes::from_static(b"key2"),
                Bytes::from_static(b"key1")
            ]
        );
        // inverted and empty ranges yield nothing instead of panicking
        let inverted = store.range(Some(b"key3".as_slice()), Some(b"key1".as_slice()), Order::Ascending);
        assert!(keys(inverted).is_empty());
        let empty = store.range(Some(b"key2".as_slice()), Some(b"key2".as_slice()), Order::Ascending);
        assert!(keys(empty).is_empty());
    }

    #[test]
    fn test_kv_store_rejects_empty_key() {
        let mut store = store();
        assert_eq!(KvStore::get(&mut store, b""), Err(Error::EmptyKey));
        assert_eq!(
            KvStore::set(&mut store, Bytes::new(), Bytes::from_static(b"v")),
            Err(Error::EmptyKey)
        );
    }
}
