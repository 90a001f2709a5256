//! Low-level FUSE protocol plumbing: wire structures, request parsing, and
//! reply serialization shared by the session loop.

use std::num::NonZeroI32;
use std::time::SystemTime;

pub(crate) mod argument;
pub(crate) mod cuse_init_flags;
pub(crate) mod errno;
pub(crate) mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod ioslice_concat;
pub(crate) mod reply;
pub(crate) mod request;
pub(crate) mod write_flags;

pub use reply::Response;
pub use request::FileHandle;
pub use request::INodeNo;
pub use request::LockOwner;
pub use request::Version;

/// A POSIX error number, as reported back to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(NonZeroI32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                /// See the POSIX errno of the same name.
                #[allow(non_upper_case_globals)]
                pub const $name: Errno = Errno(match NonZeroI32::new(libc::$name) {
                    Some(v) => v,
                    None => panic!("errno constant must be non-zero"),
                });
            )*
        }
    };
}

errno_consts!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN, ENOMEM,
    EACCES, EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE,
    EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC, ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK,
    ENAMETOOLONG, ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, EIDRM, ENODATA, ETIME, ENONET,
    ENOLINK, EBADMSG, EOVERFLOW, EILSEQ, ENOTSOCK, EOPNOTSUPP, ESTALE, ECANCELED,
);

impl Errno {
    /// Construct an `Errno` from a raw, nonzero libc error code.
    pub(crate) fn from_raw(raw: i32) -> Self {
        Errno(NonZeroI32::new(raw).unwrap_or_else(|| NonZeroI32::new(libc::EIO).unwrap()))
    }

    /// The raw libc error code.
    pub(crate) fn code(&self) -> i32 {
        self.0.get()
    }
}

impl From<Errno> for i32 {
    fn from(value: Errno) -> Self {
        value.0.get()
    }
}

impl From<i32> for Errno {
    fn from(value: i32) -> Self {
        Errno::from_raw(value)
    }
}

/// Identifies a FUSE kernel request so a reply can be routed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// File generation number, used alongside an inode to detect inode reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

impl From<Generation> for u64 {
    fn from(value: Generation) -> Self {
        value.0
    }
}

/// A `setattr` timestamp argument: either an explicit time, or "now" as observed by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// Use this specific timestamp.
    SpecificTime(SystemTime),
    /// Use the current time at the moment the operation is applied.
    Now,
}

/// A POSIX advisory file lock range, as reported to or from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    /// Inclusive byte range covered by the lock.
    pub range: (u64, u64),
    /// Lock type: `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// PID of the process holding (or blocking) the lock.
    pub pid: u32,
}
