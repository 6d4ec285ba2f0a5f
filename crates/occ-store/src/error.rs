use crate::multiversion::types::Abort;
use thiserror::Error;

/// Errors surfaced to code executing against a transaction view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A read observed an estimate; the attempt must be discarded and re-run.
    #[error("execution aborted: {0}")]
    Aborted(Abort),
    #[error("key is empty")]
    EmptyKey,
    #[error("key too large: {len} > {max}")]
    KeyTooLarge { len: usize, max: usize },
    #[error("value too large: {len} > {max}")]
    ValueTooLarge { len: usize, max: usize },
}

impl Error {
    /// The abort carried by this error, if it is a speculative conflict.
    pub fn abort(&self) -> Option<Abort> {
        match self {
            Error::Aborted(abort) => Some(*abort),
            _ => None,
        }
    }
}

impl From<Abort> for Error {
    fn from(abort: Abort) -> Self {
        Error::Aborted(abort)
    }
}
