//! Virtual-path to inode-number table (spec §4.6 front-end expects a stable
//! `INodeNo` per path across `lookup`/`getattr`/`readdir` calls).
//!
//! crossfs has no persistent inode table of its own: every path is either
//! the root, the control file, the local-alias symlink, a virtual
//! intermediate directory, or a backing candidate. We mint an inode number
//! the first time a path is seen and keep the mapping for the life of the
//! mount (spec never requires inode reuse; `forget` is a no-op).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bimap::BiMap;
use parking_lot::RwLock;

/// The FUSE protocol's fixed root inode number.
pub const FUSE_ROOT_ID: u64 = 1;

pub struct InodeTable {
    next: AtomicU64,
    map: RwLock<BiMap<u64, PathBuf>>,
}

impl InodeTable {
    pub fn new() -> InodeTable {
        let mut map = BiMap::new();
        map.insert(FUSE_ROOT_ID, PathBuf::from("/"));
        InodeTable {
            next: AtomicU64::new(FUSE_ROOT_ID + 1),
            map: RwLock::new(map),
        }
    }

    /// Return the inode for `path`, minting a fresh one if this is the
    /// first time it has been seen.
    pub fn ino_for_path(&self, path: &Path) -> u64 {
        if let Some(ino) = self.map.read().get_by_right(path) {
            return *ino;
        }
        let mut map = self.map.write();
        if let Some(ino) = map.get_by_right(path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        map.insert(ino, path.to_path_buf());
        ino
    }

    /// Look up the path a previously minted inode refers to.
    pub fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.map.read().get_by_left(&ino).cloned()
    }
}

impl Default for InodeTable {
    fn default() -> InodeTable {
        InodeTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preseeded() {
        let table = InodeTable::new();
        assert_eq!(table.ino_for_path(Path::new("/")), FUSE_ROOT_ID);
        assert_eq!(table.path_for_ino(FUSE_ROOT_ID).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn same_path_yields_same_ino() {
        let table = InodeTable::new();
        let a = table.ino_for_path(Path::new("/bin/vi"));
        let b = table.ino_for_path(Path::new("/bin/vi"));
        assert_eq!(a, b);
        assert_ne!(a, FUSE_ROOT_ID);
    }

    #[test]
    fn distinct_paths_yield_distinct_inos() {
        let table = InodeTable::new();
        let a = table.ino_for_path(Path::new("/bin/vi"));
        let b = table.ino_for_path(Path::new("/bin/emacs"));
        assert_ne!(a, b);
    }
}
