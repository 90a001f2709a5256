//! End-to-end exercise of the routing table, resolver and filters against
//! real tempdir-backed strata, without a live FUSE mount (spec §4.3, §4.4).

use std::fs;
use std::path::Path;

use bedrock_core::identity::CallerIdentity;
use bedrock_core::stratum::StratumPool;

use crossfs::config::{CrossConfig, FilterKind};
use crossfs::filters::{self, FilterEnv, InitFlavor};
use crossfs::resolver::{self, Classification};

fn caller() -> CallerIdentity {
    CallerIdentity {
        uid: 1000,
        gid: 1000,
        pid: 1,
        groups: vec![],
    }
}

#[test]
fn pass_filter_routes_to_first_existing_backing() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("alpha/usr/bin")).unwrap();
    fs::write(root.path().join("alpha/usr/bin/vi"), b"#!/bin/sh\nexec vim \"$@\"\n").unwrap();
    fs::create_dir(root.path().join("beta")).unwrap();

    let pool = StratumPool::new(root.path().to_path_buf());
    let mut config = CrossConfig::new();
    config
        .apply_command("add pass /bin/vi beta:/usr/bin/vi")
        .unwrap();
    config
        .apply_command("add pass /bin/vi alpha:/usr/bin/vi")
        .unwrap();

    let classification = resolver::classify(&config, &pool, &caller(), Path::new("/bin/vi")).unwrap();
    let Classification::Backing { filter, existing } = classification else {
        panic!("expected a Backing classification");
    };
    assert_eq!(filter, FilterKind::Pass);
    // Only alpha's copy exists on disk; beta's is skipped by the existence probe.
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0].stratum, "alpha");

    let bouncer_path = root.path().join("bouncer");
    fs::write(&bouncer_path, b"bouncer").unwrap();
    let bouncer = crossfs::bouncer::Bouncer::load(&bouncer_path).unwrap();
    let env = FilterEnv {
        strata_root: root.path(),
        bouncer: &bouncer,
        host_init: InitFlavor::Systemd,
    };
    let content = filters::materialize(filter, &env, &existing).unwrap();
    assert_eq!(content, b"#!/bin/sh\nexec vim \"$@\"\n");
}

#[test]
fn removing_last_backing_drops_the_routing_entry() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("alpha/usr/bin")).unwrap();
    fs::write(root.path().join("alpha/usr/bin/vi"), b"x").unwrap();

    let mut config = CrossConfig::new();
    config
        .apply_command("add pass /bin/vi alpha:/usr/bin/vi")
        .unwrap();
    assert!(config.referenced_strata().contains("alpha"));

    config
        .apply_command("rm pass /bin/vi alpha:/usr/bin/vi")
        .unwrap();
    assert!(config.get("/bin/vi").is_none());
    assert!(config.referenced_strata().is_empty());
}

#[test]
fn missing_backing_resolves_not_found() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("alpha")).unwrap();
    let pool = StratumPool::new(root.path().to_path_buf());
    let mut config = CrossConfig::new();
    config
        .apply_command("add pass /bin/vi alpha:/usr/bin/vi")
        .unwrap();

    let classification = resolver::classify(&config, &pool, &caller(), Path::new("/bin/vi")).unwrap();
    match classification {
        Classification::Backing { existing, .. } => assert!(existing.is_empty()),
        other => panic!("expected Backing with no existing entries, got {other:?}"),
    }
}
