//! Stratum descriptors (spec §3 "Stratum", "Handle invariants").
//!
//! A stratum is a name plus a directory descriptor opened once and retained.
//! Many routing entries can reference the same stratum; we share the open
//! descriptor via `Arc` and let the pool forget a name once its last
//! reference drops (Rust's own refcounting stands in for the ad hoc
//! refcounted handle the spec describes in §9 "Cyclic ownership").

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::identity::CallerIdentity;
use crate::xattr::read_stratum_name;

/// Name the resolver substitutes for "local" when the caller's own stratum
/// cannot be determined (sandboxed caller, kernel thread, dead process).
pub const FALLBACK_STRATUM: &str = "bedrock";

/// An opened stratum root. Cheap to clone; clones share one directory fd.
#[derive(Debug)]
pub struct StratumHandle {
    name: String,
    root: PathBuf,
    dir: File,
}

impl StratumHandle {
    fn open(name: &str, root: PathBuf) -> CoreResult<StratumHandle> {
        let dir = File::open(&root)?;
        Ok(StratumHandle {
            name: name.to_string(),
            root,
            dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw fd of the open directory, e.g. for `openat2`-relative resolution.
    pub fn as_raw_fd(&self) -> i32 {
        self.dir.as_raw_fd()
    }

    /// Join a stratum-local path onto this stratum's root.
    pub fn join(&self, local_path: &Path) -> PathBuf {
        let stripped = local_path.strip_prefix("/").unwrap_or(local_path);
        self.root.join(stripped)
    }
}

/// Pool of opened stratum directory descriptors, keyed by name, shared
/// across every routing entry. Strata roots live at `<strata_root>/<name>`.
pub struct StratumPool {
    strata_root: PathBuf,
    handles: RwLock<HashMap<String, Arc<StratumHandle>>>,
}

impl StratumPool {
    pub fn new(strata_root: PathBuf) -> StratumPool {
        StratumPool {
            strata_root,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn strata_root(&self) -> &Path {
        &self.strata_root
    }

    /// Get (opening and caching if necessary) the handle for `name`.
    pub fn get(&self, name: &str) -> CoreResult<Arc<StratumHandle>> {
        if let Some(h) = self.handles.read().get(name) {
            return Ok(h.clone());
        }
        let mut handles = self.handles.write();
        if let Some(h) = handles.get(name) {
            return Ok(h.clone());
        }
        let root = self.strata_root.join(name);
        let handle = Arc::new(StratumHandle::open(name, root)?);
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Drop the pool's reference to `name`. The descriptor itself stays open
    /// as long as any routing entry still holds an `Arc` to it; once every
    /// entry referencing it has been removed this also releases the pool's
    /// copy (last-referent close, per spec §3 "Lifecycle").
    pub fn release(&self, name: &str) {
        let mut handles = self.handles.write();
        if let Some(h) = handles.get(name) {
            if Arc::strong_count(h) <= 1 {
                handles.remove(name);
            }
        }
    }

    pub fn clear(&self) {
        self.handles.write().clear();
    }
}

/// Resolve the special "local" backing name for one request: open
/// `/proc/<pid>/root` and read its `user.bedrock.stratum` xattr (spec
/// §4.3 "Rooting in the caller's stratum"). Never cached — a caller's
/// stratum may change between requests (`strat` re-execs into another one).
pub fn resolve_local_stratum(pool: &StratumPool, identity: &CallerIdentity) -> CoreResult<Arc<StratumHandle>> {
    let proc_root = PathBuf::from(format!("/proc/{}/root", identity.pid));
    match read_stratum_name(&proc_root) {
        Ok(name) => pool.get(&name),
        Err(_) => pool.get(FALLBACK_STRATUM),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_shares_and_releases_handles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("debian")).unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());

        let a = pool.get("debian").unwrap();
        let b = pool.get("debian").unwrap();
        assert_eq!(Arc::strong_count(&a), 3); // a, b, and the pool's own copy

        drop(a);
        drop(b);
        pool.release("debian");
        assert!(pool.handles.read().get("debian").is_none());
    }

    #[test]
    fn missing_stratum_errors() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        assert!(pool.get("nonexistent").is_err());
    }
}
