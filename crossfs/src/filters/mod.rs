//! Content filters (spec §4.4). Each [`crate::config::FilterKind`] maps to a
//! `compute_size`/`stream` pair rather than a trait object (spec §9
//! "Dynamic dispatch on filter kind": closed variant, no plug-in surface).
//!
//! Filters compute the full transformed content once, then slice the
//! requested `(offset, len)` window out of it. This keeps the size `getattr`
//! reports and the bytes a `read` returns trivially consistent (testable
//! property 2) without a second, independent code path for partial reads.

mod bin;
mod font;
mod ini;
mod pass;
mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bedrock_core::error::CoreResult;
use bedrock_core::resolve::{confine, ConfinedPath};
use bedrock_core::stratum::StratumHandle;

use crate::bouncer::Bouncer;
use crate::config::FilterKind;

/// One backing location that actually exists on disk, resolved to its real
/// path (spec §4.3 "Candidate construction"). `path` is informational only
/// (xattr reporting); every actual filesystem access goes through
/// [`ResolvedBacking::confine`], which re-resolves `candidate` chroot-safely
/// against `handle` rather than trusting the existence probe's own open to
/// still describe the same inode a second time.
#[derive(Debug, Clone)]
pub struct ResolvedBacking {
    pub stratum: String,
    pub path: PathBuf,
    pub(crate) handle: Arc<StratumHandle>,
    pub(crate) candidate: PathBuf,
}

impl ResolvedBacking {
    /// Re-derive a chroot-escape-safe alias for this backing candidate
    /// (spec §4.3), suitable for `std::fs`/raw-`libc` calls.
    pub fn confine(&self) -> CoreResult<ConfinedPath> {
        confine(&self.handle, &self.candidate)
    }
}

/// Host init system flavor, for the `service` filter's unit translation
/// (spec §4.4 "service", §9 open question: restricted to one documented
/// direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFlavor {
    Systemd,
    OpenRc,
}

/// Shared, mount-lifetime state every filter may need.
pub struct FilterEnv<'a> {
    pub strata_root: &'a Path,
    pub bouncer: &'a Bouncer,
    pub host_init: InitFlavor,
}

/// Slice out up to `len` bytes starting at `offset`, per spec §4.4's
/// "skip N bytes then append up to M" helper. Used uniformly so every
/// filter's `stream` is a one-liner over its materialized content.
pub fn slice_window(content: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let offset = offset as usize;
    if offset >= content.len() {
        return Vec::new();
    }
    let end = (offset + len as usize).min(content.len());
    content[offset..end].to_vec()
}

/// Compute the full transformed byte content for `kind` given its existing
/// backing candidates. The single source of truth for both `getattr` size
/// and `read` bytes (testable properties 1-2).
pub fn materialize(
    kind: FilterKind,
    env: &FilterEnv<'_>,
    existing: &[ResolvedBacking],
) -> CoreResult<Vec<u8>> {
    match kind {
        FilterKind::Bin | FilterKind::BinRestrict => Ok(bin::materialize(env)),
        FilterKind::Ini => ini::materialize(env, existing),
        FilterKind::Service => service::materialize(env, existing),
        FilterKind::Font => font::materialize(existing),
        FilterKind::Pass => pass::materialize(existing),
    }
}

pub use bin::{BIN_MODE_MASK, BIN_MODE_OR};
