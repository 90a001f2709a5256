//! Open file handle table (spec §4.6 "State machine for an open file
//! handle"): `open`/`create` mint a handle that `read`/`write`/`flush`
//! reuse and `release` retires. Unlike crossfs (stateless, fh 0 for every
//! request since content is read-only and materialized fresh each call),
//! etcfs's backing files are opened for real read/write access, so each
//! handle owns a live `File`.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Default)]
pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, File>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: File) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(fh, file);
        fh
    }

    pub fn with<R>(&self, fh: u64, f: impl FnOnce(&mut File) -> R) -> Option<R> {
        self.open.lock().get_mut(&fh).map(f)
    }

    pub fn remove(&self, fh: u64) {
        self.open.lock().remove(&fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_roundtrips() {
        let table = HandleTable::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hi").unwrap();
        let f = File::open(&path).unwrap();
        let fh = table.insert(f);
        assert!(table.with(fh, |_| ()).is_some());
        table.remove(fh);
        assert!(table.with(fh, |_| ()).is_none());
    }
}
