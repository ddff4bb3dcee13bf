// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use thiserror::Error;

/// A specialized `Result` type for Weft runtime operations
/// that return a Weft [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the Weft runtime.
///
/// This is an umbrella type for all kinds of errors that can be produced by the runtime or
/// carried through it on behalf of workflow code. Some variants are recoverable return values
/// (e.g. [`Error::InvalidArgument`]); others are only ever observed as the payload of a panic
/// that aborts the offending coroutine (e.g. [`Error::ClosedChannel`]). See the documentation
/// of the operation you called for which applies.
///
/// The type is `Clone` because a completed future fans its outcome out to every future chained
/// onto it, and `PartialEq` so tests can assert on exact outcomes. Future versions may add
/// additional enum variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A send was attempted on a channel that has been closed. Carries the channel name.
    ///
    /// This is always fatal to the sending coroutine.
    #[error("send on closed channel {0}")]
    ClosedChannel(String),

    /// A future was consumed before a value was ever set on it. This indicates an internal
    /// invariant violation and is fatal to the consuming coroutine.
    #[error("future consumed before it was ready")]
    NotReady,

    /// `set`, `set_value` or `set_error` was called on a future that is already ready.
    /// Fatal to the calling coroutine.
    #[error("future value was already set")]
    AlreadySet,

    /// The caller of some API made a mistake (e.g. supplied invalid arguments or called an
    /// operation out of sequence). Returned to the caller where recovery is possible.
    #[error("{0}")]
    InvalidArgument(String),

    /// The dispatcher was driven incorrectly (re-entrant execution, use after close).
    #[error("dispatcher misuse: {0}")]
    DispatcherMisuse(String),

    /// An error value produced by workflow code itself, carried through futures and reported
    /// to the environment on completion.
    #[error("{0}")]
    Workflow(String),

    /// An unhandled panic escaped workflow code. Carries the rendered panic message and the
    /// cleaned stack trace captured at the panic site.
    #[error("workflow panicked: {message}")]
    UserPanic {
        /// The panic payload rendered to text.
        message: String,

        /// Stack trace captured where the panic was raised, trimmed of runtime frames.
        backtrace: String,
    },
}

/// A panic captured at a coroutine boundary.
///
/// When an unwind escapes user workflow code, the coroutine host converts it into one of these
/// before closing the coroutine state. The dispatcher returns the first captured panic of a
/// pass to its caller, and the root driver converts it into a completion-with-error reported
/// to the environment.
#[derive(Debug, Clone)]
pub struct PanicError {
    message: String,
    backtrace: String,
}

impl PanicError {
    pub(crate) fn new(message: String, backtrace: String) -> Self {
        Self { message, backtrace }
    }

    /// The panic payload rendered to text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack trace captured at the panic site, with runtime-internal frames trimmed so the
    /// topmost frames belong to workflow code.
    #[must_use]
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PanicError {}

impl From<PanicError> for Error {
    fn from(panic: PanicError) -> Self {
        Self::UserPanic {
            message: panic.message,
            backtrace: panic.backtrace,
        }
    }
}
