//! Extended-attribute helpers shared by crossfs and etcfs.
//!
//! xattr syscalls have no descriptor-based, symlink-non-following variant
//! (`fgetxattr` follows the fd, which is what we want, but there's no
//! `fgetxattr`-on-a-path-without-opening-it). To read an xattr on a path we
//! must not follow through a symlink at, and must not risk looping back into
//! our own mount (§5 "Re-entrancy and escape"), we open the path with
//! `O_NOFOLLOW|O_PATH`, then address it as `/proc/self/fd/<n>` for the
//! actual xattr call. The descriptor never performs I/O itself.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{CoreError, CoreResult};

/// The xattr bedrock stamps on every stratum root directory.
pub const STRATUM_XATTR: &str = "user.bedrock.stratum";
/// Reported on crossfs/etcfs entries: which backing location served them.
pub const LOCALPATH_XATTR: &str = "user.bedrock.localpath";
/// Reported on `bin-restrict` crossfs entries.
pub const RESTRICT_XATTR: &str = "user.bedrock.restrict";
/// Literal value of [`RESTRICT_XATTR`].
pub const RESTRICT_VALUE: &str = "restrict";

/// Open `path` as an `O_PATH|O_NOFOLLOW` descriptor, not following a trailing
/// symlink and never executing content. Used as the target for loop-safe
/// xattr access.
pub fn open_nofollow(path: &Path) -> CoreResult<OwnedFd> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CoreError::InvalidArgument("path contains NUL".into()))?;
    let raw = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Read xattr `name` on an already-open descriptor via its `/proc/self/fd/<n>`
/// alias, so we never re-enter the calling mount through a path lookup.
pub fn fgetxattr(fd: &OwnedFd, name: &str) -> CoreResult<Vec<u8>> {
    let proc_path = format!("/proc/self/fd/{}", fd.as_raw_fd());
    let c_proc = CString::new(proc_path).unwrap();
    let c_name = CString::new(name).map_err(|_| CoreError::InvalidArgument("name".into()))?;

    let needed = unsafe {
        libc::getxattr(
            c_proc.as_ptr(),
            c_name.as_ptr(),
            std::ptr::null_mut(),
            0,
        )
    };
    if needed < 0 {
        return Err(map_xattr_errno());
    }
    let mut buf = vec![0u8; needed as usize];
    if needed == 0 {
        return Ok(buf);
    }
    let got = unsafe {
        libc::getxattr(
            c_proc.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if got < 0 {
        return Err(map_xattr_errno());
    }
    buf.truncate(got as usize);
    Ok(buf)
}

/// Convenience: open `path` no-follow and read `name` off it in one call.
pub fn getxattr_path(path: &Path, name: &str) -> CoreResult<Vec<u8>> {
    let fd = open_nofollow(path)?;
    fgetxattr(&fd, name)
}

/// Read [`STRATUM_XATTR`] off `path` and decode it as UTF-8.
pub fn read_stratum_name(path: &Path) -> CoreResult<String> {
    let bytes = getxattr_path(path, STRATUM_XATTR)?;
    String::from_utf8(bytes).map_err(|_| CoreError::InvalidArgument("non-utf8 stratum xattr".into()))
}

fn map_xattr_errno() -> CoreError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENODATA) => CoreError::NoAttribute,
        Some(libc::ERANGE) => CoreError::Range,
        _ => CoreError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_nofollow_rejects_missing_path() {
        let res = open_nofollow(Path::new("/no/such/path/bedrock-core-test"));
        assert!(res.is_err());
    }

    #[test]
    fn read_stratum_name_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("marker")).unwrap();
        f.write_all(b"x").unwrap();
        let c_path = CString::new(dir.path().as_os_str().as_bytes()).unwrap();
        let c_name = CString::new(STRATUM_XATTR).unwrap();
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                b"debian".as_ptr() as *const libc::c_void,
                6,
                0,
            )
        };
        if rc != 0 {
            // xattrs unsupported on the test filesystem (e.g. tmpfs without
            // user_xattr); skip rather than fail the whole suite.
            return;
        }
        assert_eq!(read_stratum_name(dir.path()).unwrap(), "debian");
    }
}
