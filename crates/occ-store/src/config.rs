use crate::{Error, multiversion::types::Abort};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

/// Configuration for a [crate::MultiVersionStore] and the views it creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Longest key accepted by a transaction view.
    pub max_key_len: usize,
    /// Largest value accepted by a transaction view.
    pub max_value_len: usize,
    /// Capacity of the abort mailbox built by [Config::abort_channel].
    pub abort_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_key_len: 128 * 1024,
            max_value_len: 64 * 1024 * 1024,
            abort_channel_capacity: 1,
        }
    }
}

impl Config {
    pub fn validate_key(&self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if key.len() > self.max_key_len {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: self.max_key_len,
            });
        }
        Ok(())
    }

    pub fn validate_value(&self, value: &[u8]) -> Result<(), Error> {
        if value.len() > self.max_value_len {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max: self.max_value_len,
            });
        }
        Ok(())
    }

    /// Bounded mailbox carrying the abort of one execution attempt.
    pub fn abort_channel(&self) -> (SyncSender<Abort>, Receiver<Abort>) {
        sync_channel(self.abort_channel_capacity)
    }
}
