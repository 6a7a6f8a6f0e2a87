//! Error kinds raised by the event-loop core.
//!
//! The enum is `Clone` because a single failure cause fans out to every
//! listener of a promise and to every `sync` caller; I/O sources are held
//! behind an `Arc` to make that cheap.

use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was rejected up front.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not permitted in the current lifecycle state,
    /// e.g. submitting work to a loop that has shut down.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// A blocking wait was attempted on the thread that must complete it.
    #[error("blocking wait from inside the event loop would deadlock")]
    Deadlock,

    /// The readiness notifier or a registered resource failed.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// A task or readiness handler failed inside the loop body.
    #[error("event loop failure: {0}")]
    EventLoop(String),

    /// The associated future was cancelled.
    #[error("operation was cancelled")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
