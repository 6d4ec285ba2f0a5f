//! Merge iteration over speculative and committed state.
//!
//! A range scan seen by transaction `i` is the union of two sorted streams:
//! - the parent store's keys in the range, and
//! - candidate keys whose value may differ from the parent: keys written by
//!   any transaction below `i`, the attempt's own writes, and keys already
//!   pinned in its readset.
//!
//! Candidate keys shadow parent keys. Candidates resolving to a delete are
//! skipped, which also hides the parent's entry for that key.

use crate::{Error, kv::KvIter, multiversion::types::Order};
use bytes::Bytes;
use std::{cmp::Ordering, iter::Peekable, vec};

/// Resolves candidate keys while a [`MergeIterator`] advances.
pub(crate) trait KeyResolver {
    /// Current value of a candidate key, `None` if it is deleted.
    fn resolve(&mut self, key: &Bytes) -> Result<Option<Bytes>, Error>;

    /// Called for every pair served straight from the parent store.
    fn observe_parent(&mut self, key: &Bytes, value: &Bytes);
}

/// Sorted merge of candidate keys with a parent range scan.
pub(crate) struct MergeIterator<'p, R> {
    candidates: Peekable<vec::IntoIter<Bytes>>,
    parent: Peekable<KvIter<'p>>,
    order: Order,
    resolver: R,
    failed: bool,
}

impl<'p, R: KeyResolver> MergeIterator<'p, R> {
    /// `candidates` must already be restricted to the range and sorted in `order`.
    pub(crate) fn new(
        candidates: Vec<Bytes>,
        parent: KvIter<'p>,
        order: Order,
        resolver: R,
    ) -> Self {
        Self {
            candidates: candidates.into_iter().peekable(),
            parent: parent.peekable(),
            order,
            resolver,
            failed: false,
        }
    }

    pub(crate) fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }

    /// True once an item resolved to an error; the iterator yields nothing afterwards.
    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    fn next_parent(&mut self) -> Option<Result<(Bytes, Bytes), Error>> {
        let (key, value) = self.parent.next()?;
        self.resolver.observe_parent(&key, &value);
        Some(Ok((key, value)))
    }
}

impl<R: KeyResolver> Iterator for MergeIterator<'_, R> {
    type Item = Result<(Bytes, Bytes), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let order = self.order;
        loop {
            let candidate = match (self.candidates.peek(), self.parent.peek()) {
                (None, None) => return None,
                (None, Some(_)) => return self.next_parent(),
                (Some(_), None) => self.candidates.next()?,
                (Some(candidate), Some((parent_key, _))) => {
                    match compare(order, parent_key, candidate) {
                        Ordering::Less => return self.next_parent(),
                        Ordering::Equal => {
                            // shadowed by the candidate
                            self.parent.next();
                            self.candidates.next()?
                        }
                        Ordering::Greater => self.candidates.next()?,
                    }
                }
            };
            match self.resolver.resolve(&candidate) {
                Ok(Some(value)) => return Some(Ok((candidate, value))),
                Ok(None) => continue,
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

fn compare(order: Order, a: &[u8], b: &[u8]) -> Ordering {
    match order {
        Order::Ascending => a.cmp(b),
        Order::Descending => b.cmp(a),
    }
}
