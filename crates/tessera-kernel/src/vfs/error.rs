//! Storage error types.

use std::any::Any;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Broad classification of an [`FsError`], seen through any context wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unsupported,
    StorageDown,
    AlreadyExists,
    InvalidInput,
    Cancelled,
    Backend,
    Internal,
}

/// Storage error type.
///
/// Cloneable so a single failure can be handed to every caller waiting on
/// the same coalesced backend call.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// Object not found inside a storage.
    #[error("object not found: {0}")]
    NotFound(String),

    /// No mounted storage covers the path.
    #[error("storage not found: {0}")]
    StorageNotFound(String),

    /// No driver registered under the name.
    #[error("no driver named: {0}")]
    DriverNotFound(String),

    /// The target driver has no capability for the requested operation.
    #[error("not implemented: {0}")]
    Unsupported(String),

    /// The storage status is not "work".
    #[error("storage not init: {0}")]
    StorageDown(String),

    /// Path already exists with an incompatible type.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Invalid or forbidden path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A storage update tried to switch its driver type.
    #[error("driver cannot be changed: {from} -> {to}")]
    DriverConflict { from: String, to: String },

    /// Referenced storage could not be wired.
    #[error("ref: {0}")]
    Reference(String),

    /// A driver panicked while being constructed or initialized.
    #[error("[panic] {0}")]
    InitPanic(String),

    /// The caller's cancellation token fired, or the owner of a shared call went away.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Failure reported by a backend, with its original cause.
    #[error("backend error: {0}")]
    Backend(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// Storage record repository failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration (addition payload, config file).
    #[error("config error: {0}")]
    Config(String),

    /// Operation and path context around an underlying error.
    #[error("{op} [{path}]: {source}")]
    Context {
        op: String,
        path: String,
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap any error raised by a backend client.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Arc::new(err))
    }

    /// Backend failure from a plain message.
    pub fn backend_msg(msg: impl Into<String>) -> Self {
        Self::Backend(Arc::new(BackendMessage(msg.into())))
    }

    /// Attach operation and path context.
    pub fn context(self, op: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Context {
            op: op.into(),
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root_cause(&self) -> &FsError {
        let mut err = self;
        while let FsError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            FsError::NotFound(_) | FsError::StorageNotFound(_) | FsError::DriverNotFound(_) => {
                ErrorKind::NotFound
            }
            FsError::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            FsError::Unsupported(_) => ErrorKind::Unsupported,
            FsError::StorageDown(_) | FsError::InitPanic(_) => ErrorKind::StorageDown,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::NotADirectory(_)
            | FsError::NotAFile(_)
            | FsError::InvalidPath(_)
            | FsError::DriverConflict { .. }
            | FsError::Reference(_)
            | FsError::Config(_) => ErrorKind::InvalidInput,
            FsError::Cancelled => ErrorKind::Cancelled,
            FsError::Io(_) | FsError::Backend(_) => ErrorKind::Backend,
            FsError::Persistence(_) => ErrorKind::Internal,
            FsError::Context { .. } => unreachable!("root_cause strips context"),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Config(e.to_string())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct BackendMessage(String);

/// Context helpers for `FsResult`.
pub trait FsResultExt<T> {
    /// Attach operation and path context to the error, if any.
    fn context(self, op: &str, path: &str) -> FsResult<T>;
}

impl<T> FsResultExt<T> for FsResult<T> {
    fn context(self, op: &str, path: &str) -> FsResult<T> {
        self.map_err(|e| e.context(op, path))
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Storage result type.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sees_through_context() {
        let err = FsError::not_found("/a/b")
            .context("failed get parent list", "/a/b")
            .context("failed get dir", "/a/b/c");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("failed get dir [/a/b/c]"));
        assert!(err.to_string().contains("object not found: /a/b"));
    }

    #[test]
    fn test_io_not_found_is_not_found() {
        let err: FsError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());

        let err: FsError = io::Error::other("boom").into();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_backend_keeps_source() {
        let err = FsError::backend(io::Error::other("connection reset"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("driver exploded");
        assert_eq!(panic_message(payload.as_ref()), "driver exploded");
        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted"));
        assert_eq!(panic_message(payload.as_ref()), "formatted");
        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
