//! System limits shared by the path resolvers (spec §4.3 "Candidate
//! construction": "Candidates exceeding the system path-length limit are
//! skipped").

use std::path::Path;

/// Linux's `PATH_MAX`.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;
/// Linux's `NAME_MAX`, the longest a single path component may be.
pub const NAME_MAX: usize = libc::NAME_MAX as usize;

/// Whether `path`'s byte length is within `PATH_MAX`.
pub fn within_path_max(path: &Path) -> bool {
    path.as_os_str().len() < PATH_MAX
}

/// Whether every component of `path` is within `NAME_MAX`.
pub fn within_name_max(path: &Path) -> bool {
    path.components().all(|c| c.as_os_str().len() <= NAME_MAX)
}
