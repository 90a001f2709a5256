//! etcfs daemon entry point: parses the mount command line (spec §4.6
//! "Mount command line"), and mounts the filesystem.

use std::path::PathBuf;

use clap::{crate_version, Arg, ArgAction, Command};
use log::{error, info, warn, LevelFilter};

use bedrock_fuse::MountOption;
use etcfs::EtcFs;

fn main() {
    let matches = Command::new("etcfs")
        .version(crate_version!())
        .about("Per-path routing FUSE filesystem overlaying /etc for Bedrock Linux")
        .arg(
            Arg::new("mount-point")
                .required(true)
                .value_name("MOUNTPOINT")
                .help("Where to mount the etcfs view"),
        )
        .arg(
            Arg::new("strata-root")
                .long("strata-root")
                .value_name("DIR")
                .required(true)
                .help("Directory holding the per-stratum root trees"),
        )
        .arg(
            Arg::new("global-stratum")
                .long("global-stratum")
                .value_name("NAME")
                .required(true)
                .help("Stratum backing paths declared in the global-path set"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .value_name("OPT")
                .action(ArgAction::Append)
                .help("FUSE mount option, passed through to the kernel"),
        )
        .arg(
            Arg::new("foreground")
                .short('f')
                .action(ArgAction::SetTrue)
                .help("Run in the foreground (always true: this build never daemonizes)"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Debug mode: per-request traces on stderr, implies -f"),
        )
        .arg(
            Arg::new("single-threaded")
                .short('s')
                .action(ArgAction::SetTrue)
                .help("Single-threaded operation (unsupported by this bedrock-fuse build; ignored)"),
        )
        .get_matches();

    let log_level = if matches.get_flag("debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_env("RUST_LOG")
        .init();

    if !nix::unistd::geteuid().is_root() {
        error!("etcfs must be started as root");
        std::process::exit(1);
    }

    // This build never daemonizes (no fork in bedrock-fuse's session loop), so
    // `-f` is accepted for libfuse/fuser CLI compatibility but has no effect:
    // the process always runs attached to its controlling terminal. `-s`
    // requests libfuse's single-threaded dispatch, which bedrock-fuse's
    // session loop has no toggle for; accept it and warn rather than silently
    // ignoring it.
    if !matches.get_flag("foreground") {
        warn!("etcfs never daemonizes; running in the foreground regardless of -f");
    }
    if matches.get_flag("single-threaded") {
        warn!("-s/--single-threaded is not supported by this bedrock-fuse build; ignoring");
    }

    let strata_root = PathBuf::from(matches.get_one::<String>("strata-root").unwrap());
    let global_stratum = matches.get_one::<String>("global-stratum").unwrap().clone();
    let mountpoint = matches.get_one::<String>("mount-point").unwrap();

    bedrock_core::resolve::select_strategy();

    let mut options = vec![
        MountOption::FSName("etcfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::AllowOther,
    ];
    if let Some(extra) = matches.get_many::<String>("options") {
        for opt in extra {
            options.push(MountOption::CUSTOM(opt.clone()));
        }
    }

    // spec §6 "Exit behavior": the fallback chroot-based resolver (§4.3) may
    // leave the process `chroot`ed into a stratum root when the mount goes
    // away, so the initial working directory is captured now and restored
    // once `mount2` returns, ahead of the mandated `exit(0)`.
    let initial_cwd = std::env::current_dir().ok();

    info!(
        "mounting etcfs at {mountpoint} (strata root {}, global stratum {global_stratum})",
        strata_root.display()
    );
    let fs = EtcFs::new(strata_root, global_stratum);
    if let Err(e) = bedrock_fuse::mount2(fs, mountpoint, &options) {
        error!("{e}");
        std::process::exit(1);
    }

    if let Some(cwd) = initial_cwd {
        if let Err(e) = std::env::set_current_dir(&cwd) {
            error!("failed to restore working directory {}: {e}", cwd.display());
        }
    }
    std::process::exit(0);
}
