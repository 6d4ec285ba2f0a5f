//! Core types for the multi-version store.
//!
//! This module defines the fundamental types shared by every layer:
//! - Transaction indexing and versioning
//! - Abort signals emitted on speculative conflicts
//! - Read/write/iterate set aliases

use bytes::Bytes;
use derive_more::Display;
use std::collections::{BTreeMap, HashMap};

/// Index of a transaction within a block (0-based).
pub type TxnIndex = u32;

/// Incarnation number - incremented each time a transaction is re-executed.
/// Starts at 0 for the first execution.
pub type Incarnation = u32;

/// A version uniquely identifies a specific execution of a transaction.
/// Consists of (transaction index, incarnation number).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("(txn={txn_idx}, inc={incarnation})")]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self {
            txn_idx,
            incarnation,
        }
    }
}

/// Signal that an execution attempt observed an estimate written by a lower
/// transaction and must be re-run once that transaction has finished.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("estimate from txn {dependent_txn_idx}")]
pub struct Abort {
    /// The transaction whose pending write was observed.
    pub dependent_txn_idx: TxnIndex,
}

impl Abort {
    pub fn estimate(dependent_txn_idx: TxnIndex) -> Self {
        Self { dependent_txn_idx }
    }
}

/// Result of reading a key from the multi-version store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// A lower transaction wrote this key. `None` is a delete.
    Value {
        value: Option<Bytes>,
        version: Version,
    },
    /// No lower transaction wrote this key; the parent store has the answer.
    NotFound,
    /// The closest lower write is an estimate; the reader must abort.
    Aborted {
        /// The transaction that owns the estimate
        txn_idx: TxnIndex,
    },
}

/// Iteration direction.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    Ascending,
    Descending,
}

/// Pending writes of one execution attempt. `None` marks a delete.
///
/// Sorted so that iteration candidates and commits are deterministic.
pub type WriteSet = BTreeMap<Bytes, Option<Bytes>>;

/// Values observed by one execution attempt, keyed by storage key.
///
/// Every distinct observation of a key is kept; a key with more than one
/// observation can never validate.
pub type ReadSet = HashMap<Bytes, Vec<Option<Bytes>>>;
