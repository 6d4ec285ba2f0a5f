//! Multi-version concurrency control for parallel block execution.
//!
//! Transactions of a block run speculatively and in parallel, yet must end up
//! with the outcome of running them one after another in index order. This
//! module provides the state side of that protocol:
//!
//! 1. Each execution attempt runs against a [`TransactionView`]
//! 2. The view records what it read, wrote and iterated over
//! 3. Reads that hit a pending write of a lower transaction abort the attempt
//! 4. Published attempts are re-validated against the [`MultiVersionStore`]
//! 5. Once every attempt validates, the latest writes are flushed to the parent
//!
//! # Architecture
//!
//! - [`types`]: Core types (TxnIndex, Version, Abort)
//! - [`value`]: Per-key version chain
//! - [`store`]: Multi-version data structure shared by all workers
//! - [`view`]: Per-attempt store recording reads and writes
//! - [`tracker`]: Iteration records replayed at validation time
//! - `iterator`: Merge of speculative keys with the parent store

pub(crate) mod iterator;
pub mod store;
pub mod tracker;
pub mod types;
pub mod value;
pub mod view;


// Re-export commonly used types
pub use store::MultiVersionStore;
pub use tracker::{IterateSet, IterationTracker};
pub use types::{Abort, Incarnation, Order, ReadResult, ReadSet, TxnIndex, Version, WriteSet};
pub use value::{EntryValue, VersionedEntry, VersionedValueChain};
pub use view::{TransactionView, ViewIterator};
