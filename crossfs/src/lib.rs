//! crossfs: a read-mostly FUSE filesystem that unions and rewrites files
//! from multiple Bedrock Linux strata under one virtual tree (spec
//! OVERVIEW, §4).

pub mod bouncer;
pub mod config;
pub mod filters;
pub mod fs;
pub mod inode;
pub mod resolver;

pub use fs::CrossFs;
