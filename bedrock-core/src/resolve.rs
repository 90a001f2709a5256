//! Chroot-escape-safe path resolution (spec §4.3 "Avoiding chroot-escape").
//!
//! Every backing-file operation must be evaluated as if rooted at a
//! stratum's root directory, so that an absolute symlink stored inside a
//! stratum resolves inside that stratum rather than escaping to the real
//! root. Two strategies are implemented; one is chosen once at startup and
//! used for the life of the mount (§4.3, §9 "Chroot-escape resolution").

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use nix::fcntl::OFlag;

use crate::error::CoreResult;
use crate::stratum::StratumHandle;

/// Which chroot-escape-avoidance mechanism this mount uses. Probed once at
/// startup and fixed for the mount's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// `openat2(2)` with `RESOLVE_IN_ROOT`, restartable per call, no global
    /// lock needed: the kernel itself refuses to resolve outside `dirfd`.
    Openat2,
    /// `fchdir` + `chroot(".")` under a process-wide mutex, for kernels
    /// without `openat2`.
    ChrootFallback,
}

static STRATEGY: OnceLock<ResolveStrategy> = OnceLock::new();

/// Select and cache the resolution strategy for this process. Call once at
/// startup, before the first request is served.
pub fn select_strategy() -> ResolveStrategy {
    *STRATEGY.get_or_init(probe_openat2)
}

fn current_strategy() -> ResolveStrategy {
    *STRATEGY.get_or_init(probe_openat2)
}

fn probe_openat2() -> ResolveStrategy {
    let root = match CString::new("/") {
        Ok(c) => c,
        Err(_) => return ResolveStrategy::ChrootFallback,
    };
    let how = OpenHow {
        flags: libc::O_RDONLY as u64,
        mode: 0,
        resolve: RESOLVE_IN_ROOT,
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            libc::AT_FDCWD,
            root.as_ptr(),
            &how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    if ret >= 0 {
        unsafe {
            libc::close(ret as i32);
        }
        ResolveStrategy::Openat2
    } else {
        ResolveStrategy::ChrootFallback
    }
}

/// `struct open_how` from `openat2(2)`; not (yet) exposed by the `libc` crate
/// on every target, so it's laid out here to match the kernel ABI exactly.
#[repr(C)]
struct OpenHow {
    flags: u64,
    mode: u64,
    resolve: u64,
}

const RESOLVE_IN_ROOT: u64 = 0x10;

/// Process-wide mutex guarding the chroot fallback's critical section (§5
/// "Shared resources": "held across `fchdir`+`chroot`+syscall"). Only one
/// thread may be inside a chroot at a time.
static CHROOT_LOCK: Mutex<Option<String>> = Mutex::new(None);

/// Open `path` (relative to `stratum`'s root) with `flags`, using whichever
/// strategy was selected for this mount.
pub fn open_in_stratum(stratum: &StratumHandle, path: &Path, flags: OFlag) -> CoreResult<File> {
    match current_strategy() {
        ResolveStrategy::Openat2 => open_via_openat2(stratum, path, flags),
        ResolveStrategy::ChrootFallback => open_via_chroot(stratum, path, flags),
    }
}

fn open_via_openat2(stratum: &StratumHandle, path: &Path, flags: OFlag) -> CoreResult<File> {
    let rel = path.strip_prefix("/").unwrap_or(path);
    let c_path = CString::new(rel.as_os_str().as_bytes())
        .map_err(|_| crate::error::CoreError::InvalidArgument("path contains NUL".into()))?;
    let how = OpenHow {
        flags: flags.bits() as u64,
        mode: 0o666,
        resolve: RESOLVE_IN_ROOT,
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            stratum.as_raw_fd(),
            c_path.as_ptr(),
            &how as *const OpenHow,
            std::mem::size_of::<OpenHow>(),
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { File::from_raw_fd(ret as i32) })
}

/// Fallback: serialize on `CHROOT_LOCK`, `fchdir` into the stratum root,
/// `chroot(".")`, perform the open, and leave the chroot set as a cache hint
/// so back-to-back operations against the same stratum skip the repeat
/// `chroot` call (§4.3 "fallback" / `current_root_fd` tracking).
fn open_via_chroot(stratum: &StratumHandle, path: &Path, flags: OFlag) -> CoreResult<File> {
    let mut cached = CHROOT_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    if cached.as_deref() != Some(stratum.name()) {
        nix::unistd::fchdir(stratum.as_raw_fd()).map_err(std::io::Error::from)?;
        nix::unistd::chroot(".").map_err(std::io::Error::from)?;
        *cached = Some(stratum.name().to_string());
    }
    let rel = path.strip_prefix("/").unwrap_or(path);
    let fd = nix::fcntl::open(rel, flags, nix::sys::stat::Mode::from_bits_truncate(0o666))
        .map_err(std::io::Error::from)?;
    Ok(File::from(fd))
}

/// Whether `path` exists inside `stratum`, resolved chroot-safely. Used by
/// the path resolvers' candidate probing (spec §4.3 "Candidate construction":
/// "the first candidate for which the underlying existence probe succeeds").
pub fn exists_in_stratum(stratum: &StratumHandle, path: &Path) -> bool {
    open_in_stratum(stratum, path, OFlag::O_PATH | OFlag::O_NOFOLLOW).is_ok()
}

/// `lstat`-equivalent metadata for `path` inside `stratum`, resolved
/// chroot-safely.
pub fn symlink_metadata_in_stratum(stratum: &StratumHandle, path: &Path) -> CoreResult<std::fs::Metadata> {
    let f = open_in_stratum(stratum, path, OFlag::O_PATH | OFlag::O_NOFOLLOW)?;
    Ok(f.metadata()?)
}

/// A stratum-confined path alias, backed by an `O_PATH`-opened parent
/// directory descriptor and addressed as `/proc/self/fd/<n>/<name>`. Every
/// `std::fs` or raw-`libc` call made against [`ConfinedPath::as_path`]
/// resolves only its final component, relative to a directory whose own
/// resolution already went through [`open_in_stratum`] — so it never
/// re-walks, and therefore never re-trusts, the ancestor chain a second
/// time (spec §4.3). Unlike [`symlink_metadata_in_stratum`]'s probe, the
/// leaf need not exist yet: this is what makes the alias usable for
/// `create`/`mkdir`/`symlink`/`rename`, not just reads.
///
/// The parent descriptor is kept alive inside this struct; dropping it
/// invalidates the `/proc/self/fd` entry, so a `ConfinedPath` must outlive
/// every use of its alias.
pub struct ConfinedPath {
    _parent: File,
    alias: PathBuf,
}

impl ConfinedPath {
    pub fn as_path(&self) -> &Path {
        &self.alias
    }
}

impl std::ops::Deref for ConfinedPath {
    type Target = Path;
    fn deref(&self) -> &Path {
        &self.alias
    }
}

impl AsRef<Path> for ConfinedPath {
    fn as_ref(&self) -> &Path {
        &self.alias
    }
}

/// Confine `path` (stratum-relative, e.g. `/etc/passwd`) to a
/// [`ConfinedPath`]: resolve everything up to its parent directory
/// chroot-safely, then address the final component relative to that
/// confined directory. Replaces a bare `stratum.join(path)` everywhere a
/// caller-influenced path feeds a real filesystem operation.
pub fn confine(stratum: &StratumHandle, path: &Path) -> CoreResult<ConfinedPath> {
    let name = path
        .file_name()
        .ok_or_else(|| crate::error::CoreError::InvalidArgument("path has no file name".into()))?;
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    let parent_f = open_in_stratum(stratum, parent, OFlag::O_PATH | OFlag::O_DIRECTORY)?;
    let alias = PathBuf::from(format!("/proc/self/fd/{}", parent_f.as_raw_fd())).join(name);
    Ok(ConfinedPath { _parent: parent_f, alias })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::StratumPool;

    #[test]
    fn probe_does_not_panic() {
        let _ = probe_openat2();
    }

    #[test]
    fn confine_reads_and_creates_through_proc_alias() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("debian")).unwrap();
        std::fs::write(dir.path().join("debian/existing"), b"hi").unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        let stratum = pool.get("debian").unwrap();

        let existing = confine(&stratum, Path::new("/existing")).unwrap();
        assert_eq!(std::fs::read(existing.as_path()).unwrap(), b"hi");

        let fresh = confine(&stratum, Path::new("/fresh")).unwrap();
        std::fs::write(fresh.as_path(), b"new").unwrap();
        assert_eq!(std::fs::read(dir.path().join("debian/fresh")).unwrap(), b"new");
    }

    #[test]
    fn confine_rejects_root_path() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        std::fs::create_dir(dir.path().join("bedrock")).unwrap();
        let stratum = pool.get("bedrock").unwrap();
        assert!(confine(&stratum, Path::new("/")).is_err());
    }
}
