//! `pass` filter (spec §4.4): bytes forwarded verbatim.

use bedrock_core::error::{CoreError, CoreResult};

use super::ResolvedBacking;

pub fn materialize(existing: &[ResolvedBacking]) -> CoreResult<Vec<u8>> {
    let backing = existing.first().ok_or(CoreError::NotFound)?;
    Ok(std::fs::read(&backing.confine()?)?)
}
