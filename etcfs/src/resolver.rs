//! etcfs path classification and routing (spec §4.3): every path under the
//! mount overlays `/etc`'s namesake path inside either the caller's local
//! stratum or the configured global stratum.

use std::path::{Path, PathBuf};

use bedrock_core::error::CoreResult;
use bedrock_core::identity::CallerIdentity;
use bedrock_core::stratum::{resolve_local_stratum, StratumHandle, StratumPool};
use std::sync::Arc;

use crate::config::EtcConfig;

pub const CONTROL_FILE_NAME: &str = ".bedrock-config-filesystem";
pub const LOCAL_ALIAS_NAME: &str = ".local-alias";

#[derive(Debug)]
pub enum Classification {
    Root,
    ControlFile,
    LocalAlias,
    /// `etc_path` is the `/etc`-rooted path used both for the global-path
    /// set lookup and as the stratum-relative backing path.
    Routed { etc_path: PathBuf, global: bool },
}

/// Classify `path` (mount-relative, e.g. `/hostname` for `/etc/hostname`)
/// against the live config (spec §4.3 rules, adapted to etcfs's flat
/// local-vs-global split rather than crossfs's routing table).
pub fn classify(config: &EtcConfig, path: &Path) -> Classification {
    if path == Path::new("/") {
        return Classification::Root;
    }
    if path == Path::new("/").join(CONTROL_FILE_NAME) {
        return Classification::ControlFile;
    }
    if path == Path::new("/").join(LOCAL_ALIAS_NAME) {
        return Classification::LocalAlias;
    }
    let etc_path = Path::new("/etc").join(path.strip_prefix("/").unwrap_or(path));
    let global = config.is_global(&etc_path.to_string_lossy());
    Classification::Routed { etc_path, global }
}

/// Resolve the stratum a routed path's backing file lives in: the
/// configured global stratum, or the caller's own (spec §4.3 "Rooting in
/// the caller's stratum").
pub fn backing_stratum(
    pool: &StratumPool,
    identity: &CallerIdentity,
    global_stratum: &str,
    global: bool,
) -> CoreResult<Arc<StratumHandle>> {
    if global {
        pool.get(global_stratum)
    } else {
        resolve_local_stratum(pool, identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_classifies_as_root() {
        let cfg = EtcConfig::new();
        assert!(matches!(classify(&cfg, Path::new("/")), Classification::Root));
    }

    #[test]
    fn control_file_name_is_recognized() {
        let cfg = EtcConfig::new();
        let path = Path::new("/").join(CONTROL_FILE_NAME);
        assert!(matches!(classify(&cfg, &path), Classification::ControlFile));
    }

    #[test]
    fn global_membership_routes_to_global() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_global /etc/hostname").unwrap();
        match classify(&cfg, Path::new("/hostname")) {
            Classification::Routed { etc_path, global } => {
                assert_eq!(etc_path, PathBuf::from("/etc/hostname"));
                assert!(global);
            }
            other => panic!("expected Routed, got {other:?}"),
        }
    }

    #[test]
    fn non_global_path_routes_to_local() {
        let cfg = EtcConfig::new();
        match classify(&cfg, Path::new("/passwd")) {
            Classification::Routed { global, .. } => assert!(!global),
            other => panic!("expected Routed, got {other:?}"),
        }
    }
}
