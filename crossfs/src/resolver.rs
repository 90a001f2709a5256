//! crossfs path resolution (spec §4.3): classify an incoming virtual path
//! and, for backing candidates, probe strata in order for existence.

use std::path::{Path, PathBuf};

use bedrock_core::error::CoreResult;
use bedrock_core::identity::CallerIdentity;
use bedrock_core::resolve::exists_in_stratum;
use bedrock_core::stratum::{resolve_local_stratum, StratumPool};

use crate::config::{CrossConfig, FilterKind};
use crate::filters::ResolvedBacking;

pub const CONTROL_FILE_NAME: &str = ".bedrock-config-filesystem";
pub const LOCAL_ALIAS_NAME: &str = ".local-alias";
/// Sentinel stratum name meaning "the caller's own stratum" (spec §3
/// "local alias", §4.3 "Rooting in the caller's stratum").
pub const LOCAL_BACKING_NAME: &str = "local";

#[derive(Debug)]
pub enum Classification {
    Root,
    ControlFile,
    LocalAlias,
    VirtualIntermediate,
    Backing {
        filter: FilterKind,
        existing: Vec<ResolvedBacking>,
    },
    NotFound,
}

/// Classify `path` against the live routing table (spec §4.3 rules 1-6,
/// checked in order).
pub fn classify(
    config: &CrossConfig,
    pool: &StratumPool,
    identity: &CallerIdentity,
    path: &Path,
) -> CoreResult<Classification> {
    // Rule 1: path is a configured virtual path or a descendant of one.
    for (vpath, entry) in config.entries() {
        let vpath_path = Path::new(vpath);
        if path == vpath_path || path.starts_with(append_slash(vpath_path)) {
            let suffix = path.strip_prefix(vpath_path).unwrap_or(Path::new(""));
            let mut existing = Vec::new();
            for backing in &entry.backings {
                let stratum_name = &backing.stratum;
                let handle = if stratum_name == LOCAL_BACKING_NAME {
                    resolve_local_stratum(pool, identity)
                } else {
                    pool.get(stratum_name)
                };
                let Ok(handle) = handle else { continue };
                let candidate = join_suffix(Path::new(&backing.local_path), suffix);
                if !bedrock_core::limits::within_path_max(&candidate) {
                    continue;
                }
                if exists_in_stratum(&handle, &candidate) {
                    existing.push(ResolvedBacking {
                        stratum: handle.name().to_string(),
                        path: handle.join(&candidate),
                        handle: handle.clone(),
                        candidate,
                    });
                }
            }
            return Ok(Classification::Backing {
                filter: entry.filter,
                existing,
            });
        }
    }

    // Rule 2: path is an ancestor of some configured virtual path.
    for vpath in config.entries().keys() {
        if Path::new(vpath).starts_with(append_slash(path)) && path != Path::new(vpath) {
            return Ok(Classification::VirtualIntermediate);
        }
    }

    // Rule 3: mount root.
    if path == Path::new("/") {
        return Ok(Classification::Root);
    }

    // Rule 4: control file.
    if path == Path::new("/").join(CONTROL_FILE_NAME) {
        return Ok(Classification::ControlFile);
    }

    // Rule 5: local-alias symlink.
    if path == Path::new("/").join(LOCAL_ALIAS_NAME) {
        return Ok(Classification::LocalAlias);
    }

    // Rule 6: does not exist.
    Ok(Classification::NotFound)
}

fn append_slash(path: &Path) -> PathBuf {
    if path == Path::new("/") {
        PathBuf::from("/")
    } else {
        PathBuf::from(format!("{}/", path.display()))
    }
}

fn join_suffix(local_path: &Path, suffix: &Path) -> PathBuf {
    if suffix.as_os_str().is_empty() {
        local_path.to_path_buf()
    } else {
        local_path.join(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrossConfig;
    use bedrock_core::stratum::StratumPool;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            uid: 1000,
            gid: 1000,
            pid: std::process::id() as i32,
            groups: vec![],
        }
    }

    #[test]
    fn root_classifies_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        let cfg = CrossConfig::new();
        let c = classify(&cfg, &pool, &caller(), Path::new("/")).unwrap();
        assert!(matches!(c, Classification::Root));
    }

    #[test]
    fn control_file_name_is_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        let cfg = CrossConfig::new();
        let path = Path::new("/").join(CONTROL_FILE_NAME);
        let c = classify(&cfg, &pool, &caller(), &path).unwrap();
        assert!(matches!(c, Classification::ControlFile));
    }

    #[test]
    fn backing_entry_resolves_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("strataA/usr/bin")).unwrap();
        std::fs::write(dir.path().join("strataA/usr/bin/vi"), b"elf-bytes").unwrap();
        std::fs::create_dir_all(dir.path().join("strataB/usr/bin")).unwrap();

        let pool = StratumPool::new(dir.path().to_path_buf());
        let mut cfg = CrossConfig::new();
        cfg.apply_command("add bin /bin/vi strataA:/usr/bin/vi").unwrap();
        cfg.apply_command("add bin /bin/vi strataB:/usr/bin/vi").unwrap();

        let c = classify(&cfg, &pool, &caller(), Path::new("/bin/vi")).unwrap();
        match c {
            Classification::Backing { existing, .. } => {
                assert_eq!(existing.len(), 1);
                assert_eq!(existing[0].stratum, "strataA");
            }
            other => panic!("expected Backing, got {other:?}"),
        }
    }
}
