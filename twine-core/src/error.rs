//! Error types for the fiber runtime.
//!
//! User-level failures never unwind across a context switch: a fiber body
//! returns a [`CoreError`], the trampoline records it in the fiber's
//! diagnostics slot, and `join`/`cord_join` move it to the waiting side.

use thiserror::Error;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The fiber observed a cancellation request at a cancellation point.
    #[error("fiber is cancelled")]
    Cancelled,

    /// A wait primitive ran out of time.
    #[error("timed out")]
    Timeout,

    /// An operating system call failed.
    #[error("{syscall} failed: {source}")]
    System {
        /// Name of the failing syscall.
        syscall: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A caller violated an API precondition.
    #[error("illegal parameters: {0}")]
    IllegalParams(String),

    /// The fiber body panicked; the panic was caught at the trampoline.
    #[error("fiber panicked: {0}")]
    FiberPanic(String),

    /// `join` was called on a fiber that is not joinable.
    #[error("the fiber is not joinable")]
    Unjoinable,
}

impl CoreError {
    /// Wrap an OS error with the syscall that produced it.
    pub fn system(syscall: &'static str, source: std::io::Error) -> Self {
        Self::System { syscall, source }
    }

    /// True for the cancellation marker error.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True for the timeout marker error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;
