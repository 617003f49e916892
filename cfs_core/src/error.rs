//! The CFS error taxonomy.
//!
//! Every kind maps 1:1 onto a fixed wire error code so that protocol
//! responses can carry a typed `(code, message)` pair instead of a stack
//! trace. Storage backends and the virtual filesystem both speak this
//! vocabulary; the façade never wraps or retries, it surfaces the drive's
//! error unchanged.

/// Crate-wide result alias for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Errors surfaced by drives, the virtual filesystem, and operation
/// handlers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FsError {
    /// A permission or mode check failed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Malformed path, operation, flags, or buffer.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The file descriptor is invalid or not open.
    #[error("not opened: {0}")]
    NotOpened(String),

    /// The operation is intentionally unimplemented by design.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A dispatch table entry exists but the handler is unbuilt.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Unexpected failure inside a handler or backend.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Fixed wire code for this error kind. `0` is reserved for "no error".
    pub fn code(&self) -> u32 {
        match self {
            FsError::AccessDenied(_) => 1,
            FsError::BadRequest(_) => 2,
            FsError::NotFound(_) => 3,
            FsError::NotOpened(_) => 4,
            FsError::NotSupported(_) => 5,
            FsError::NotImplemented(_) => 6,
            FsError::Internal(_) => 7,
        }
    }

    /// Rebuilds an error from its wire code and message. Unknown codes
    /// collapse into [`FsError::Internal`].
    pub fn from_code(code: u32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            1 => FsError::AccessDenied(message),
            2 => FsError::BadRequest(message),
            3 => FsError::NotFound(message),
            4 => FsError::NotOpened(message),
            5 => FsError::NotSupported(message),
            6 => FsError::NotImplemented(message),
            _ => FsError::Internal(message),
        }
    }
}
