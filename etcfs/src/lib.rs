//! etcfs: a per-path routing FUSE filesystem overlaying `/etc` for Bedrock
//! Linux, rooting each request in the caller's own stratum and enforcing
//! declared content overrides (spec OVERVIEW, §4).

pub mod config;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod override_engine;
pub mod resolver;

pub use fs::EtcFs;
