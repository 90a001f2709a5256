//! Virtual-path to inode-number table, identical in spirit to crossfs's:
//! etcfs mints an inode the first time a mount-relative path is seen and
//! keeps it for the life of the mount.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bimap::BiMap;
use parking_lot::RwLock;

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

    pub fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.map.read().get_by_left(&ino).cloned()
    }

    /// Re-key an inode to a new path (spec §4.6 `rename`): the inode
    /// identity must survive across the rename so open handles referring
    /// to it keep working.
    pub fn rekey(&self, old: &Path, new: PathBuf) {
        let mut map = self.map.write();
        if let Some((ino, _)) = map.remove_by_right(old) {
            map.insert(ino, new);
        }
    }

    pub fn forget_path(&self, path: &Path) {
        self.map.write().remove_by_right(path);
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
    }

    #[test]
    fn same_path_yields_same_ino() {
        let table = InodeTable::new();
        let a = table.ino_for_path(Path::new("/hostname"));
        let b = table.ino_for_path(Path::new("/hostname"));
        assert_eq!(a, b);
    }

    #[test]
    fn rekey_preserves_ino_across_rename() {
        let table = InodeTable::new();
        let ino = table.ino_for_path(Path::new("/foo"));
        table.rekey(Path::new("/foo"), PathBuf::from("/bar"));
        assert_eq!(table.path_for_ino(ino).unwrap(), PathBuf::from("/bar"));
        assert_eq!(table.ino_for_path(Path::new("/bar")), ino);
    }
}
