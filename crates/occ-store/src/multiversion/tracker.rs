//! Iterate-set tracking.
//!
//! Point reads are revalidated through the readset, but an iteration also
//! depends on which keys were *absent* from the range. Each iterator
//! therefore leaves an [`IterationTracker`] behind: the keys it yielded, in
//! order, plus enough context to replay the same iteration at validation
//! time and compare.

use crate::{
    Error,
    multiversion::types::{Order, WriteSet},
};
use bytes::Bytes;

/// Iteration records of one execution attempt.
pub type IterateSet = Vec<IterationTracker>;

/// Record of one iterator created by a transaction view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationTracker {
    start: Option<Bytes>,
    end: Option<Bytes>,
    order: Order,
    /// Pending writes of the attempt when the iterator was created.
    writeset: WriteSet,
    iterated_keys: Vec<Bytes>,
    exhausted: bool,
}

impl IterationTracker {
    pub fn new(start: Option<Bytes>, end: Option<Bytes>, order: Order, writeset: WriteSet) -> Self {
        Self {
            start,
            end,
            order,
            writeset,
            iterated_keys: Vec::new(),
            exhausted: false,
        }
    }

    pub fn start(&self) -> Option<&[u8]> {
        self.start.as_deref()
    }

    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn writeset(&self) -> &WriteSet {
        &self.writeset
    }

    pub fn iterated_keys(&self) -> &[Bytes] {
        &self.iterated_keys
    }

    /// The last key yielded before the caller stopped, if it stopped early.
    pub fn early_stop_key(&self) -> Option<&Bytes> {
        if self.exhausted {
            return None;
        }
        self.iterated_keys.last()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn add_key(&mut self, key: Bytes) {
        self.iterated_keys.push(key);
    }

    pub(crate) fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// Check a replay of this iteration against what was originally yielded.
    ///
    /// The replay must produce the same keys in the same order. If the
    /// original iteration ran to the end, the replay must end there too; if
    /// it stopped early, keys past the early-stop key are irrelevant.
    pub fn validate<I>(&self, mut replay: I) -> bool
    where
        I: Iterator<Item = Result<(Bytes, Bytes), Error>>,
    {
        for expected in &self.iterated_keys {
            match replay.next() {
                Some(Ok((key, _))) if key == *expected => {}
                _ => return false,
            }
        }
        if !self.exhausted {
            return true;
        }
        replay.next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiversion::types::Abort;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    fn replay(keys: &[&'static str]) -> impl Iterator<Item = Result<(Bytes, Bytes), Error>> {
        keys.iter()
            .map(|k| Ok((key(*k), Bytes::new())))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn tracker(keys: &[&'static str], exhausted: bool) -> IterationTracker {
        let mut tracker = IterationTracker::new(None, None, Order::Ascending, WriteSet::new());
        for k in keys {
            tracker.add_key(key(*k));
        }
        if exhausted {
            tracker.mark_exhausted();
        }
        tracker
    }

    #[test]
    fn test_exhausted_iteration_requires_exact_replay() {
        let tracker = tracker(&["a", "b", "c"], true);
        assert_eq!(tracker.early_stop_key(), None);
        assert!(tracker.validate(replay(&["a", "b", "c"])));
        // a key appeared after the end
        assert!(!tracker.validate(replay(&["a", "b", "c", "d"])));
        // a key disappeared
        assert!(!tracker.validate(replay(&["a", "c"])));
        // a key was replaced
        assert!(!tracker.validate(replay(&["a", "bb", "c"])));
    }

    #[test]
    fn test_early_stop_ignores_later_keys() {
        let tracker = tracker(&["a", "b"], false);
        assert_eq!(tracker.early_stop_key(), Some(&key("b")));
        assert!(tracker.validate(replay(&["a", "b", "c", "d"])));
        assert!(!tracker.validate(replay(&["a", "c"])));
    }

    #[test]
    fn test_untouched_iterator_is_always_valid() {
        let tracker = tracker(&[], false);
        assert!(tracker.validate(replay(&["a"])));
        assert!(tracker.validate(replay(&[])));
    }

    #[test]
    fn test_replay_error_invalidates() {
        let tracker = tracker(&["a"], true);
        let failing = vec![Err(Error::Aborted(Abort::estimate(1)))].into_iter();
        assert!(!tracker.validate(failing));
    }
}
