//! etcfs's configuration store: the global-path set and the override table
//! (spec §3 "Override", "Global-path set", §4.2).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bedrock_core::config::validate_virtual_path;
use bedrock_core::error::{CoreError, CoreResult};
use parking_lot::RwLock;

/// One override's declared shape (spec §3 "Override").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideKind {
    Symlink(String),
    Directory,
    Inject(Vec<u8>),
}

impl OverrideKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OverrideKind::Symlink(_) => "symlink",
            OverrideKind::Directory => "directory",
            OverrideKind::Inject(_) => "inject",
        }
    }

    fn content(&self) -> String {
        match self {
            OverrideKind::Symlink(target) => target.clone(),
            OverrideKind::Directory => String::new(),
            OverrideKind::Inject(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// A declared override, plus the rate-limit bookkeeping from spec §4.5.
#[derive(Debug, Clone)]
pub struct Override {
    pub kind: OverrideKind,
    pub last_applied: Option<Instant>,
}

/// Minimum interval between two enforcements of the same override (spec
/// §4.5 "Rate-limit"): suppresses races with package managers that
/// create-then-check files in rapid succession.
pub const OVERRIDE_REAPPLY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Default)]
pub struct EtcConfig {
    globals: BTreeSet<String>,
    overrides: BTreeMap<String, Override>,
}

impl EtcConfig {
    pub fn new() -> EtcConfig {
        EtcConfig {
            globals: BTreeSet::new(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn is_global(&self, path: &str) -> bool {
        self.globals.contains(path)
    }

    pub fn overrides(&self) -> &BTreeMap<String, Override> {
        &self.overrides
    }

    pub fn override_for(&self, path: &str) -> Option<&Override> {
        self.overrides.get(path)
    }

    /// Record that `path`'s override was just (re-)applied, for the
    /// rate-limit check in §4.5.
    pub fn mark_applied(&mut self, path: &str, when: Instant) {
        if let Some(entry) = self.overrides.get_mut(path) {
            entry.last_applied = Some(when);
        }
    }

    fn add_global(&mut self, path: &str) -> CoreResult<()> {
        validate_virtual_path(path)?;
        self.globals.insert(path.to_string());
        Ok(())
    }

    fn rm_global(&mut self, path: &str) -> CoreResult<()> {
        validate_virtual_path(path)?;
        self.globals.remove(path);
        Ok(())
    }

    fn add_override(&mut self, kind: OverrideKind, path: &str) -> CoreResult<()> {
        validate_virtual_path(path)?;
        self.overrides.insert(
            path.to_string(),
            Override {
                kind,
                last_applied: None,
            },
        );
        Ok(())
    }

    fn rm_override(&mut self, path: &str) -> CoreResult<()> {
        validate_virtual_path(path)?;
        self.overrides.remove(path);
        Ok(())
    }

    /// Apply one already-newline-stripped control command (spec §4.2).
    pub fn apply_command(&mut self, line: &str) -> CoreResult<()> {
        let mut words = line.split(' ');
        match words.next() {
            Some("clear") => {
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("clear takes no arguments".into()));
                }
                self.globals.clear();
                self.overrides.clear();
                Ok(())
            }
            Some("add_global") => {
                let path = words.next().ok_or_else(missing_arg)?;
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("too many arguments to add_global".into()));
                }
                self.add_global(path)
            }
            Some("rm_global") => {
                let path = words.next().ok_or_else(missing_arg)?;
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("too many arguments to rm_global".into()));
                }
                self.rm_global(path)
            }
            Some("add_override") => {
                let kind = words.next().ok_or_else(missing_arg)?;
                let path = words.next().ok_or_else(missing_arg)?;
                let rest: Vec<&str> = words.collect();
                let content = rest.join(" ");
                let kind = match kind {
                    "symlink" => {
                        if content.is_empty() {
                            return Err(missing_arg());
                        }
                        OverrideKind::Symlink(content)
                    }
                    "directory" => OverrideKind::Directory,
                    "inject" => {
                        if content.is_empty() {
                            return Err(missing_arg());
                        }
                        OverrideKind::Inject(unescape(&content))
                    }
                    other => return Err(CoreError::InvalidArgument(format!("unknown override kind `{other}`"))),
                };
                self.add_override(kind, path)
            }
            Some("rm_override") => {
                let path = words.next().ok_or_else(missing_arg)?;
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("too many arguments to rm_override".into()));
                }
                self.rm_override(path)
            }
            Some(other) => Err(CoreError::InvalidArgument(format!("unknown command `{other}`"))),
            None => Err(CoreError::InvalidArgument("empty command".into())),
        }
    }

    /// Serialize the whole store back to add-form, one command per line
    /// (spec §4.2 "Read protocol", testable property 6).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for path in &self.globals {
            out.push_str("add_global ");
            out.push_str(path);
            out.push('\n');
        }
        for (path, ov) in &self.overrides {
            out.push_str("add_override ");
            out.push_str(ov.kind.tag());
            out.push(' ');
            out.push_str(path);
            out.push(' ');
            out.push_str(&escape(&ov.kind.content()));
            out.push('\n');
        }
        out
    }
}

/// `\n` inside an inject override's content can't appear literally in a
/// single-line wire record (spec §4.2 "the record must end with exactly one
/// newline"), so it round-trips escaped.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('\\') => out.push(b'\\'),
                Some(other) => {
                    out.push(b'\\');
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => out.push(b'\\'),
            }
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

fn missing_arg() -> CoreError {
    CoreError::InvalidArgument("missing argument".into())
}

/// The RwLock-guarded store handed to the `Filesystem` implementation.
pub type EtcConfigStore = RwLock<EtcConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_global_then_rm_global_roundtrips() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_global /etc/hostname").unwrap();
        assert!(cfg.is_global("/etc/hostname"));
        cfg.apply_command("rm_global /etc/hostname").unwrap();
        assert!(!cfg.is_global("/etc/hostname"));
    }

    #[test]
    fn symlink_override_roundtrips_through_serialize() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_override symlink /etc/mtab /proc/self/mounts")
            .unwrap();
        let serialized = cfg.serialize();
        let mut replay = EtcConfig::new();
        for line in serialized.lines() {
            replay.apply_command(line).unwrap();
        }
        assert_eq!(replay.serialize(), serialized);
        assert_eq!(
            replay.override_for("/etc/mtab").unwrap().kind,
            OverrideKind::Symlink("/proc/self/mounts".to_string())
        );
    }

    #[test]
    fn inject_override_preserves_embedded_newline() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_override inject /etc/shells #bedrock-marker\\n")
            .unwrap();
        match &cfg.override_for("/etc/shells").unwrap().kind {
            OverrideKind::Inject(bytes) => assert_eq!(bytes, b"#bedrock-marker\n"),
            other => panic!("expected Inject, got {other:?}"),
        }
    }

    #[test]
    fn rm_override_drops_entry() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_override directory /etc/cron.d").unwrap();
        cfg.apply_command("rm_override /etc/cron.d").unwrap();
        assert!(cfg.override_for("/etc/cron.d").is_none());
    }

    #[test]
    fn clear_drops_globals_and_overrides() {
        let mut cfg = EtcConfig::new();
        cfg.apply_command("add_global /etc/hostname").unwrap();
        cfg.apply_command("add_override directory /etc/cron.d").unwrap();
        cfg.apply_command("clear").unwrap();
        assert!(cfg.overrides().is_empty());
        assert!(!cfg.is_global("/etc/hostname"));
    }
}
