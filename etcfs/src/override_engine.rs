//! Override engine (spec §4.5): enforces a declared file-shape invariant —
//! `symlink`, `directory`, or `inject` — on a backing path before any other
//! handler work touches it, subject to a one-second reapplication rate
//! limit shared across callers racing the same path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bedrock_core::error::{CoreError, CoreResult};

use crate::config::{EtcConfigStore, Override, OverrideKind, OVERRIDE_REAPPLY_INTERVAL};

/// Suffix given to the temporary file used for atomic rewrite-in-place
/// (injection and uninjection alike).
const TMP_SUFFIX: &str = ".bedrock-etcfs-tmp";

/// Check `real_path`'s declared override, if any, and enforce it. Called at
/// the top of every handler that takes a path (spec §4.5 "before any other
/// work"). A no-op if `etc_path` has no override, or if the override was
/// enforced less than [`OVERRIDE_REAPPLY_INTERVAL`] ago.
pub fn enforce(config: &EtcConfigStore, etc_path: &str, real_path: &Path) -> CoreResult<()> {
    let now = Instant::now();
    let Some(ov) = should_enforce(config, etc_path, now) else {
        return Ok(());
    };
    let result = apply(&ov, real_path);
    config.write().mark_applied(etc_path, now);
    // Override enforcement failures are surfaced as EFBIG (§7 "Propagation
    // policy") so the caller sees the override system is in an abnormal
    // state rather than mistaking it for an ordinary syscall error.
    result.map_err(|_| CoreError::OverrideFailed)
}

/// Snapshot the override under the read lock and decide whether the rate
/// limit permits enforcing it now. Returns the override to apply, if any.
fn should_enforce(config: &EtcConfigStore, etc_path: &str, now: Instant) -> Option<Override> {
    let guard = config.read();
    let ov = guard.override_for(etc_path)?;
    if let Some(last) = ov.last_applied {
        if now.saturating_duration_since(last) <= OVERRIDE_REAPPLY_INTERVAL {
            return None;
        }
    }
    Some(ov.clone())
}

fn apply(ov: &Override, real_path: &Path) -> std::io::Result<()> {
    match &ov.kind {
        OverrideKind::Symlink(target) => enforce_symlink(real_path, target),
        OverrideKind::Directory => enforce_directory(real_path),
        OverrideKind::Inject(bytes) => inject(real_path, bytes),
    }
}

/// `real_path` must be a symlink pointing at `target`; anything else
/// (missing, wrong target, regular file, directory) is removed and
/// recreated.
fn enforce_symlink(real_path: &Path, target: &str) -> std::io::Result<()> {
    match fs::symlink_metadata(real_path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(real_path)?.as_os_str() == Path::new(target).as_os_str() {
                return Ok(());
            }
            fs::remove_file(real_path)?;
        }
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(real_path)?,
        Ok(_) => fs::remove_file(real_path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, real_path)
}

/// `real_path` must be a directory; created with mode 0755 if absent.
fn enforce_directory(real_path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(real_path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(real_path)?;
            mkdir_0755(real_path)
        }
        Ok(_) => {
            fs::remove_file(real_path)?;
            mkdir_0755(real_path)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => mkdir_0755(real_path),
        Err(e) => Err(e),
    }
}

fn mkdir_0755(real_path: &Path) -> std::io::Result<()> {
    fs::create_dir(real_path)?;
    fs::set_permissions(real_path, fs::Permissions::from_mode(0o755))
}

/// Inject `needle` into `real_path` if it isn't already present. Atomic:
/// write a sibling temporary, then rename over the original (spec §4.5
/// "Injection is atomic and idempotent"). Empty files are left untouched so
/// a program that creates-then-populates a file never observes injected
/// content in its zero-byte window.
fn inject(real_path: &Path, needle: &[u8]) -> std::io::Result<()> {
    let mut original = match File::open(real_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let meta = original.metadata()?;
    if meta.len() == 0 {
        return Ok(());
    }
    let mut content = Vec::with_capacity(meta.len() as usize);
    original.read_to_end(&mut content)?;
    if contains(&content, needle) {
        return Ok(());
    }

    let tmp_path = sibling_tmp(real_path);
    let result = (|| -> std::io::Result<()> {
        let mut tmp = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(meta.permissions().mode())
            .open(&tmp_path)?;
        tmp.write_all(&content)?;
        tmp.write_all(needle)?;
        tmp.flush()?;
        fs::rename(&tmp_path, real_path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Uninject `needle` from `real_path` (spec §4.5 "Uninjection"): first
/// occurrence only, same atomic rename-over-original pattern. A no-op if
/// the file doesn't contain `needle`.
pub fn uninject(real_path: &Path, needle: &[u8]) -> std::io::Result<()> {
    let content = match fs::read(real_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let Some(pos) = find(&content, needle) else {
        return Ok(());
    };
    let mut excised = Vec::with_capacity(content.len() - needle.len());
    excised.extend_from_slice(&content[..pos]);
    excised.extend_from_slice(&content[pos + needle.len()..]);

    let mode = fs::metadata(real_path)?.permissions().mode();
    let tmp_path = sibling_tmp(real_path);
    let result = (|| -> std::io::Result<()> {
        let mut tmp = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp_path)?;
        tmp.write_all(&excised)?;
        tmp.flush()?;
        fs::rename(&tmp_path, real_path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Build the sibling temporary path used for atomic rewrite-in-place,
/// shared with cross-device rename's regular-file copy (`fs.rs`).
pub(crate) fn sibling_tmp(real_path: &Path) -> PathBuf {
    let mut name = real_path.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    real_path.with_file_name(name)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shells");
        fs::write(&path, b"/bin/sh\n").unwrap();
        inject(&path, b"#bedrock-marker\n").unwrap();
        inject(&path, b"#bedrock-marker\n").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("#bedrock-marker").count(), 1);
    }

    #[test]
    fn inject_skips_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        inject(&path, b"marker\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn uninject_removes_single_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shells");
        fs::write(&path, b"/bin/sh\n#bedrock-marker\n/bin/bash\n").unwrap();
        uninject(&path, b"#bedrock-marker\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "/bin/sh\n/bin/bash\n");
    }

    #[test]
    fn enforce_symlink_replaces_wrong_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtab");
        fs::write(&path, b"not a symlink").unwrap();
        enforce_symlink(&path, "/proc/self/mounts").unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), Path::new("/proc/self/mounts"));
    }

    #[test]
    fn enforce_directory_creates_0755() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron.d");
        enforce_directory(&path).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }
}
