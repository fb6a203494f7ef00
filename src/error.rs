use std::os::fd::RawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::handle::HandleType;

/// Errors returned by the interrupt core.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IntrError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No interrupt source is registered for the handle's fd.
    #[error("no interrupt source registered for fd {0}")]
    NotFound(RawFd),

    /// The source's callbacks are running on the dispatch thread right now;
    /// retry once they return.
    #[error("interrupt source for fd {0} is busy")]
    Busy(RawFd),

    #[error("out of memory")]
    AllocationFailure,

    /// The mutation itself succeeded but the dispatch thread could not be
    /// woken; the wait set is rebuilt on the next successful wake.
    #[error("failed to signal the dispatch thread wake pipe")]
    BrokenPipe,

    #[error("unsupported interrupt handle type {0:?}")]
    UnsupportedType(HandleType),

    /// The event slot is already registered with a multiplexer.
    #[error("event slot already added")]
    AlreadyExists,

    #[error("syscall failed: {0}")]
    Io(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, IntrError>;
