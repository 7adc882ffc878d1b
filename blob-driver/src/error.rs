use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

use crate::Digest;

/// Categorizes storage errors by their semantic meaning, independent of
/// the blob store implementation which produced them.
///
/// Callers should match on the kind rather than inspecting error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested blob was not found.
    ///
    /// **Caller action:** Handle as a missing resource (e.g. a 404).
    NotFound,

    /// The process lacks permission to read or write the backing store.
    ///
    /// **Caller action:** Check file permissions on the storage directory.
    PermissionDenied,

    /// The operation failed due to an I/O error.
    Io,

    /// The request was invalid (malformed digest, bad parameters).
    InvalidRequest,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Map an I/O error onto the closest storage error kind.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        }
    }

    /// Returns whether this error indicates a client-side fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::NotFound | StorageErrorKind::InvalidRequest
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace, controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// Span context at the point the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// An error from a blob store, with the digest and store it concerns.
///
/// # Example
///
/// ```rust
/// use blob_driver::{Digest, StorageError, StorageErrorKind};
///
/// let digest = Digest::sha256(b"hello");
/// let error = StorageError::builder(
///     "disk",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
/// )
/// .digest(&digest)
/// .context("read blob")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,

    /// The name of the blob store that produced this error.
    engine: &'static str,

    digest: Option<String>,

    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            digest: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a storage error from an I/O error, deriving the kind from it.
    pub fn io(engine: &'static str, error: io::Error) -> Self {
        Self::new(engine, StorageErrorKind::from_io(&error), error)
    }

    /// A `NotFound` error for a digest which is not present in the store.
    pub fn not_found(engine: &'static str, digest: &Digest) -> Self {
        Self::builder(
            engine,
            StorageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, format!("blob not found: {digest}")),
        )
        .digest(digest)
        .build()
    }

    /// Create a builder for a storage error with optional context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            digest: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a storage error from a downstream error,
    /// for use with `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Whether this error means the blob does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the blob store name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the digest this error concerns, if known.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(digest) = &self.digest {
            write!(f, " (digest: {})", digest)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for a [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    digest: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the digest.
    pub fn digest(mut self, digest: &Digest) -> Self {
        self.digest = Some(digest.to_string());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            digest: self.digest,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_are_mapped() {
        let err = StorageError::io("disk", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());

        let err = StorageError::io(
            "disk",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.kind(), StorageErrorKind::PermissionDenied);

        let err = StorageError::io("disk", io::Error::other("boom"));
        assert_eq!(err.kind(), StorageErrorKind::Io);
    }

    #[test]
    fn display_includes_context() {
        let digest = Digest::sha256(b"x");
        let err = StorageError::builder("memory", StorageErrorKind::Other, "broken")
            .digest(&digest)
            .context("put blob")
            .build();

        let message = err.to_string();
        assert!(message.starts_with("Storage error [other error] from memory"));
        assert!(message.contains(digest.as_str()));
        assert!(message.contains("(put blob)"));
        assert!(message.ends_with(": broken"));
    }

    #[test]
    fn not_found_carries_digest() {
        let digest = Digest::sha256(b"missing");
        let err = StorageError::not_found("memory", &digest);
        assert!(err.is_not_found());
        assert_eq!(err.digest(), Some(digest.as_str()));
        assert!(err.kind().is_client_fault());
    }
}
