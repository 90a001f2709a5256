//! Shared error taxonomy (spec §7) for the crossfs/etcfs daemons.
//!
//! Everything below the FUSE boundary returns `Result<T, CoreError>`. Each
//! daemon's `Filesystem` impl converts a `CoreError` to a `bedrock_fuse::Errno`
//! exactly once, at the reply site, via [`CoreError::to_errno`].

use bedrock_fuse::Errno;
use thiserror::Error;

/// The closed set of failure classes the core logic can produce.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed control command, non-`/` path, unknown filter/override kind.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Path resolved to no existing backing candidate, or no config entry.
    #[error("not found")]
    NotFound,
    /// Non-root caller touched the control file, or wrote to a read-only path.
    #[error("permission denied")]
    PermissionDenied,
    /// Write attempted against a read-only mount surface.
    #[error("read-only filesystem")]
    ReadOnly,
    /// Caller's buffer is too small for the xattr/data being returned.
    #[error("range")]
    Range,
    /// A candidate path or control command exceeded system limits.
    #[error("name too long")]
    NameTooLong,
    /// Recognized but unimplemented operation (e.g. `rename` flags).
    #[error("not supported")]
    Unsupported,
    /// Unknown extended attribute name.
    #[error("no such attribute")]
    NoAttribute,
    /// Allocation or resource exhaustion.
    #[error("out of memory")]
    OutOfMemory,
    /// Override enforcement failed mid-handler; surfaced as EFBIG per §7 so
    /// callers don't mistake it for an ordinary syscall error.
    #[error("override enforcement failed")]
    OverrideFailed,
    /// Opaque passthrough of an OS error from an underlying syscall.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map to the POSIX errno the kernel should see, per spec.md §7's table.
    pub fn to_errno(&self) -> Errno {
        match self {
            CoreError::InvalidArgument(_) => Errno::EINVAL,
            CoreError::NotFound => Errno::ENOENT,
            CoreError::PermissionDenied => Errno::EACCES,
            CoreError::ReadOnly => Errno::EROFS,
            CoreError::Range => Errno::ERANGE,
            CoreError::NameTooLong => Errno::ENAMETOOLONG,
            CoreError::Unsupported => Errno::ENOSYS,
            CoreError::NoAttribute => Errno::ENODATA,
            CoreError::OutOfMemory => Errno::ENOMEM,
            CoreError::OverrideFailed => Errno::EFBIG,
            CoreError::Io(e) => e.raw_os_error().map(Errno::from).unwrap_or(Errno::EIO),
        }
    }
}

/// Convenience alias used throughout `bedrock-core`, `crossfs` and `etcfs`.
pub type CoreResult<T> = Result<T, CoreError>;
