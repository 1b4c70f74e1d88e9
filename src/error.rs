// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;
use std::io;

/// Stable error kinds surfaced by the public API.
///
/// Kept as a plain enum with a hand-written `Display`/`Error` impl rather than
/// pulling in a derive-macro crate: the variant set is small and fixed, and
/// each arm needs its own wording.
#[derive(Debug)]
pub enum Error {
    /// Null handle, wrong lifecycle state, or an out-of-range block index.
    InvalidArgument(String),
    /// Allocator refusal.
    NoMemory,
    /// Short read/write or an underlying backend error.
    Io(io::Error),
    /// Magic mismatch, CRC mismatch, or an unrecognized version stamp.
    InvalidFormat(String),
    /// Version stamp not present in the dispatch table.
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NoMemory => write!(f, "allocation failed"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::InvalidFormat(msg) => write!(f, "invalid image format: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Prepends context to an `Error`'s message, the same way the teacher's
/// `ErrorContext` does for a bare `io::Error`.
pub trait ErrorContext {
    fn context<C: fmt::Display>(self, context: C) -> Self;
}

impl ErrorContext for Error {
    fn context<C: fmt::Display>(self, context: C) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), format!("{context}: {e}"))),
            Error::InvalidArgument(msg) => Error::InvalidArgument(format!("{context}: {msg}")),
            Error::InvalidFormat(msg) => Error::InvalidFormat(format!("{context}: {msg}")),
            Error::NotFound(msg) => Error::NotFound(format!("{context}: {msg}")),
            Error::NoMemory => Error::NoMemory,
        }
    }
}

/// Lifts `ErrorContext` to `Result` types.
pub trait ResultErrorContext {
    fn err_context<C: fmt::Display, F: FnOnce() -> C>(self, context: F) -> Self;
}

impl<V> ResultErrorContext for Result<V> {
    fn err_context<C: fmt::Display, F: FnOnce() -> C>(self, context: F) -> Self {
        self.map_err(|err| err.context(context()))
    }
}
