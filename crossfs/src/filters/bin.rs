//! `bin` / `bin-restrict` filters (spec §4.4): substitute the bouncer's
//! bytes for the backing executable's content.

use super::FilterEnv;

/// Bits guaranteed set on a `bin`/`bin-restrict` entry's reported mode
/// (owner/group/other read).
pub const BIN_MODE_OR: u32 = 0o444;
/// Bits stripped from a `bin`/`bin-restrict` entry's reported mode
/// (setuid/setgid/sticky).
pub const BIN_MODE_MASK: u32 = !(libc::S_ISUID | libc::S_ISGID | libc::S_ISVTX) as u32;

pub fn materialize(env: &FilterEnv<'_>) -> Vec<u8> {
    env.bouncer.bytes().to_vec()
}
