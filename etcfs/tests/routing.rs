//! End-to-end exercise of etcfs's classification, stratum routing and
//! override enforcement against a real tempdir-backed stratum, without a
//! live FUSE mount (spec §4.3, §4.5).

use std::fs;
use std::path::Path;

use bedrock_core::stratum::StratumPool;

use etcfs::config::EtcConfig;
use etcfs::override_engine;
use etcfs::resolver::{self, Classification};

#[test]
fn global_path_routes_into_the_global_stratum() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("bedrock/etc")).unwrap();
    fs::write(root.path().join("bedrock/etc/hostname"), b"bedrock\n").unwrap();

    let mut config = EtcConfig::new();
    config.apply_command("add_global /etc/hostname").unwrap();

    let classification = resolver::classify(&config, Path::new("/hostname"));
    let Classification::Routed { etc_path, global } = classification else {
        panic!("expected a Routed classification");
    };
    assert_eq!(etc_path, Path::new("/etc/hostname"));
    assert!(global);

    let pool = StratumPool::new(root.path().to_path_buf());
    let stratum = pool.get("bedrock").unwrap();
    let real_path = bedrock_core::resolve::confine(&stratum, &etc_path).unwrap();
    assert_eq!(fs::read(&real_path).unwrap(), b"bedrock\n");
}

#[test]
fn symlink_override_is_enforced_before_use() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("bedrock/etc")).unwrap();
    fs::write(root.path().join("bedrock/etc/mtab"), b"stale\n").unwrap();

    let config = etcfs::config::EtcConfigStore::new({
        let mut c = EtcConfig::new();
        c.apply_command("add_override symlink /etc/mtab /proc/self/mounts")
            .unwrap();
        c
    });

    let pool = StratumPool::new(root.path().to_path_buf());
    let stratum = pool.get("bedrock").unwrap();
    let real_path = bedrock_core::resolve::confine(&stratum, Path::new("/etc/mtab")).unwrap();

    override_engine::enforce(&config, "/etc/mtab", &real_path).unwrap();

    let meta = fs::symlink_metadata(root.path().join("bedrock/etc/mtab")).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(
        fs::read_link(root.path().join("bedrock/etc/mtab")).unwrap(),
        Path::new("/proc/self/mounts")
    );
}

#[test]
fn rm_global_stops_routing_it_as_global() {
    let mut config = EtcConfig::new();
    config.apply_command("add_global /etc/hostname").unwrap();
    config.apply_command("rm_global /etc/hostname").unwrap();

    let classification = resolver::classify(&config, Path::new("/hostname"));
    let Classification::Routed { global, .. } = classification else {
        panic!("expected a Routed classification");
    };
    assert!(!global);
}
