//! Generic control-file plumbing shared by crossfs's and etcfs's config
//! stores (spec §4.2).
//!
//! Each daemon owns its own routing/override table and wraps it in a
//! [`parking_lot::RwLock`]; this module supplies the wire-protocol rules
//! that are identical for both: atomic-write-sized single-line commands,
//! UID-0-only access, and a serialization whose byte length matches the
//! file's reported `getattr` size exactly.

use crate::error::{CoreError, CoreResult};

/// A single control-file write must fit in one atomic pipe write. Linux
/// guarantees atomicity for writes up to `PIPE_BUF` (4096 on Linux); the
/// protocol is defined against that constant rather than `PIPE_BUF` at
/// runtime because callers write to a regular file, not a pipe, and the
/// limit here is a protocol choice, not an OS guarantee being relied upon.
pub const MAX_COMMAND_LEN: usize = 4096;

/// Validate the wire-level shape of one control-file write: non-empty,
/// at most [`MAX_COMMAND_LEN`] bytes, and terminated by exactly one `\n`
/// with no interior newline (spec §4.2 "Write protocol").
pub fn validate_command_bytes(buf: &[u8]) -> CoreResult<&str> {
    if buf.is_empty() {
        return Err(CoreError::InvalidArgument("empty command".into()));
    }
    if buf.len() > MAX_COMMAND_LEN {
        return Err(CoreError::NameTooLong);
    }
    let s = std::str::from_utf8(buf)
        .map_err(|_| CoreError::InvalidArgument("command is not valid utf-8".into()))?;
    let Some(body) = s.strip_suffix('\n') else {
        return Err(CoreError::InvalidArgument("command must end in a newline".into()));
    };
    if body.contains('\n') {
        return Err(CoreError::InvalidArgument("command must be a single line".into()));
    }
    Ok(body)
}

/// Require the caller attempting to open/read/write the control file to be
/// UID 0 (spec §4.2 "Only UID 0 may open it for read or write").
pub fn require_root(caller_uid: u32) -> CoreResult<()> {
    if caller_uid == 0 {
        Ok(())
    } else {
        Err(CoreError::PermissionDenied)
    }
}

/// A stratum-local backing location: `<stratum>:<stratum-local-path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backing {
    pub stratum: String,
    pub local_path: String,
}

impl Backing {
    /// Parse `<stratum>:<path>`. Stratum names may not contain `/`; the
    /// local path must start with `/` (spec §4.2 "Parsing is strict").
    pub fn parse(token: &str) -> CoreResult<Backing> {
        let (stratum, local_path) = token
            .split_once(':')
            .ok_or_else(|| CoreError::InvalidArgument(format!("malformed backing `{token}`")))?;
        if stratum.is_empty() || stratum.contains('/') {
            return Err(CoreError::InvalidArgument(format!(
                "invalid stratum name `{stratum}`"
            )));
        }
        if !local_path.starts_with('/') {
            return Err(CoreError::InvalidArgument(format!(
                "local path `{local_path}` must start with /"
            )));
        }
        Ok(Backing {
            stratum: stratum.to_string(),
            local_path: local_path.to_string(),
        })
    }

    pub fn format(&self) -> String {
        format!("{}:{}", self.stratum, self.local_path)
    }
}

/// Validate a virtual path argument: must start with `/` (spec §4.2).
pub fn validate_virtual_path(path: &str) -> CoreResult<()> {
    if !path.starts_with('/') {
        return Err(CoreError::InvalidArgument(format!(
            "virtual path `{path}` must start with /"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_bytes_requires_trailing_newline() {
        assert!(validate_command_bytes(b"clear").is_err());
        assert_eq!(validate_command_bytes(b"clear\n").unwrap(), "clear");
    }

    #[test]
    fn validate_command_bytes_rejects_embedded_newline() {
        assert!(validate_command_bytes(b"clear\nrm\n").is_err());
    }

    #[test]
    fn validate_command_bytes_rejects_oversize() {
        let mut big = vec![b'a'; MAX_COMMAND_LEN + 1];
        big.push(b'\n');
        assert!(matches!(
            validate_command_bytes(&big),
            Err(CoreError::NameTooLong)
        ));
    }

    #[test]
    fn backing_parse_roundtrip() {
        let b = Backing::parse("debian:/usr/bin/vi").unwrap();
        assert_eq!(b.stratum, "debian");
        assert_eq!(b.local_path, "/usr/bin/vi");
        assert_eq!(b.format(), "debian:/usr/bin/vi");
    }

    #[test]
    fn backing_parse_rejects_slash_in_stratum() {
        assert!(Backing::parse("de/bian:/usr/bin/vi").is_err());
    }

    #[test]
    fn backing_parse_rejects_relative_local_path() {
        assert!(Backing::parse("debian:usr/bin/vi").is_err());
    }
}
