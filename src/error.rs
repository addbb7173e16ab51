//! Error types for event loop operations.
//!
//! Every fallible operation returns [`Result`], and completion callbacks
//! receive the same [`Error`] type through their completion object, so a
//! caller handles start-time failures and completion-time failures with one
//! vocabulary.
//!
//! Errors are explicit and typed: a copyable [`ErrorKind`], an optional
//! context string, and an optional source error (usually the
//! [`std::io::Error`] carrying the platform error code).

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request is in the wrong state for the requested transition.
    InvalidState,
    /// Request belongs to a different loop.
    WrongLoop,
    /// Descriptor is not valid, or the loop has been closed.
    InvalidHandle,
    /// A syscall failed; the source carries the platform error code.
    Kernel,
    /// Read, write, send or receive issued with a zero-byte buffer.
    EmptyBuffer,
    /// The peer closed the connection (zero-byte receive, or connect
    /// reported a socket error).
    PeerClosed,
    /// A completion fired after the request had been cancelled.
    Cancelled,
    /// Internal invariant violation (bug in the loop).
    Internal,
    /// The requested kernel API is not available on this build.
    Unsupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The error type for event loop operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports a cancelled completion.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error originated in a failed syscall.
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, ErrorKind::Kernel)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a `Kernel` error from the calling thread's `errno`.
    ///
    /// `ctx` names the syscall that failed.
    #[must_use]
    pub fn last_os_error(ctx: &'static str) -> Self {
        Self::new(ErrorKind::Kernel)
            .with_context(ctx)
            .with_source(std::io::Error::last_os_error())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Kernel).with_source(e)
    }
}

/// Extension trait for attaching context to fallible calls.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }
}

/// A specialized Result type for event loop operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "InvalidState");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::EmptyBuffer).with_context("zero sized read buffer");
        assert_eq!(err.to_string(), "EmptyBuffer: zero sized read buffer");
    }

    #[test]
    fn source_chain_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "underlying");
        let err = Error::new(ErrorKind::Kernel)
            .with_context("recv")
            .with_source(io);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn from_io_error_is_kernel() {
        let io = std::io::Error::from_raw_os_error(libc::EBADF);
        let err: Error = io.into();
        assert!(err.is_kernel());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.context("send failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Kernel);
        assert!(err.to_string().starts_with("Kernel: send failed"));
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new(ErrorKind::Cancelled).is_cancelled());
        assert!(!Error::new(ErrorKind::Cancelled).is_kernel());
        assert!(Error::new(ErrorKind::Kernel).is_kernel());
    }
}
