//! Multi-version key-value store for optimistic parallel transaction execution.

pub mod config;
pub mod error;
pub mod kv;
pub mod multiversion;

pub use config::Config;
pub use error::Error;
pub use kv::{BackingStore, KvIter, KvStore, MemStore};
pub use multiversion::{
    Abort, Incarnation, MultiVersionStore, Order, TransactionView, TxnIndex, Version,
};
