//! crossfs's routing table (spec §3 "Routing entry", §4.2).

use std::collections::{BTreeMap, HashSet};

use bedrock_core::config::{validate_virtual_path, Backing};
use bedrock_core::error::{CoreError, CoreResult};
use parking_lot::RwLock;

/// One of the five content transforms, plus `pass` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Bin,
    BinRestrict,
    Ini,
    Font,
    Service,
    Pass,
}

impl FilterKind {
    pub fn parse(s: &str) -> CoreResult<FilterKind> {
        match s {
            "bin" => Ok(FilterKind::Bin),
            "bin-restrict" => Ok(FilterKind::BinRestrict),
            "ini" => Ok(FilterKind::Ini),
            "font" => Ok(FilterKind::Font),
            "service" => Ok(FilterKind::Service),
            "pass" => Ok(FilterKind::Pass),
            other => Err(CoreError::InvalidArgument(format!("unknown filter `{other}`"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Bin => "bin",
            FilterKind::BinRestrict => "bin-restrict",
            FilterKind::Ini => "ini",
            FilterKind::Font => "font",
            FilterKind::Service => "service",
            FilterKind::Pass => "pass",
        }
    }
}

/// A configured virtual path: the filter it was first created with, and the
/// ordered backing list probed to satisfy it (spec §3 invariant: filter kind
/// is fixed by the first entry that created it).
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub filter: FilterKind,
    pub backings: Vec<Backing>,
}

/// The live routing table, guarded by one readers-writer lock (spec §4.2
/// "Locking"). Keyed by virtual path so lookups during request handling are
/// O(log n) rather than a linear scan of every entry.
#[derive(Default)]
pub struct CrossConfig {
    entries: BTreeMap<String, RoutingEntry>,
}

impl CrossConfig {
    pub fn new() -> CrossConfig {
        CrossConfig {
            entries: BTreeMap::new(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, RoutingEntry> {
        &self.entries
    }

    pub fn get(&self, virtual_path: &str) -> Option<&RoutingEntry> {
        self.entries.get(virtual_path)
    }

    /// Every stratum name named by some backing across the whole routing
    /// table, excluding the `local` sentinel (which resolves to a
    /// caller-dependent real stratum rather than a name the pool caches
    /// directly). Used to detect, by before/after diff, when a mutation
    /// drops the last reference to a stratum (spec §3 pool lifecycle).
    pub fn referenced_strata(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for entry in self.entries.values() {
            for backing in &entry.backings {
                if backing.stratum != crate::resolver::LOCAL_BACKING_NAME {
                    set.insert(backing.stratum.clone());
                }
            }
        }
        set
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn add(&mut self, filter: FilterKind, virtual_path: &str, backing: Backing) -> CoreResult<()> {
        validate_virtual_path(virtual_path)?;
        match self.entries.get_mut(virtual_path) {
            Some(entry) => {
                if entry.filter.as_str() != filter.as_str() {
                    // Filter kind is fixed by the first entry; later adds with a
                    // mismatched filter are effectively ignored (spec §3).
                    return Ok(());
                }
                if !entry.backings.contains(&backing) {
                    entry.backings.push(backing);
                }
            }
            None => {
                self.entries.insert(
                    virtual_path.to_string(),
                    RoutingEntry {
                        filter,
                        backings: vec![backing],
                    },
                );
            }
        }
        Ok(())
    }

    fn remove(&mut self, filter: FilterKind, virtual_path: &str, backing: &Backing) -> CoreResult<()> {
        validate_virtual_path(virtual_path)?;
        let Some(entry) = self.entries.get_mut(virtual_path) else {
            return Ok(());
        };
        if entry.filter.as_str() != filter.as_str() {
            return Ok(());
        }
        entry.backings.retain(|b| b != backing);
        if entry.backings.is_empty() {
            self.entries.remove(virtual_path);
        }
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
                self.clear();
                Ok(())
            }
            Some("add") => {
                let filter = FilterKind::parse(words.next().ok_or_else(missing_arg)?)?;
                let vpath = words.next().ok_or_else(missing_arg)?;
                let backing = Backing::parse(words.next().ok_or_else(missing_arg)?)?;
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("too many arguments to add".into()));
                }
                self.add(filter, vpath, backing)
            }
            Some("rm") => {
                let filter = FilterKind::parse(words.next().ok_or_else(missing_arg)?)?;
                let vpath = words.next().ok_or_else(missing_arg)?;
                let backing = Backing::parse(words.next().ok_or_else(missing_arg)?)?;
                if words.next().is_some() {
                    return Err(CoreError::InvalidArgument("too many arguments to rm".into()));
                }
                self.remove(filter, vpath, &backing)
            }
            Some(other) => Err(CoreError::InvalidArgument(format!("unknown command `{other}`"))),
            None => Err(CoreError::InvalidArgument("empty command".into())),
        }
    }

    /// Serialize every routing entry back to add-form, one command per line
    /// (spec §4.2 "Read protocol"). Round-tripping this through
    /// `apply_command` restores the same logical state (testable property 6).
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (vpath, entry) in &self.entries {
            for backing in &entry.backings {
                out.push_str("add ");
                out.push_str(entry.filter.as_str());
                out.push(' ');
                out.push_str(vpath);
                out.push(' ');
                out.push_str(&backing.format());
                out.push('\n');
            }
        }
        out
    }
}

fn missing_arg() -> CoreError {
    CoreError::InvalidArgument("missing argument".into())
}

/// The RwLock-guarded store handed to the `Filesystem` implementation.
pub type CrossConfigStore = RwLock<CrossConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_serialize_roundtrips() {
        let mut cfg = CrossConfig::new();
        cfg.apply_command("add bin /bin/vi strataA:/usr/bin/vi").unwrap();
        cfg.apply_command("add bin /bin/vi strataB:/usr/bin/vi").unwrap();
        let serialized = cfg.serialize();
        let mut replay = CrossConfig::new();
        for line in serialized.lines() {
            replay.apply_command(line).unwrap();
        }
        assert_eq!(replay.serialize(), serialized);
    }

    #[test]
    fn mismatched_filter_on_existing_entry_is_ignored() {
        let mut cfg = CrossConfig::new();
        cfg.apply_command("add bin /bin/vi strataA:/usr/bin/vi").unwrap();
        cfg.apply_command("add ini /bin/vi strataB:/usr/bin/vi").unwrap();
        assert_eq!(cfg.get("/bin/vi").unwrap().backings.len(), 1);
    }

    #[test]
    fn rm_last_backing_drops_entry() {
        let mut cfg = CrossConfig::new();
        cfg.apply_command("add bin /bin/vi strataA:/usr/bin/vi").unwrap();
        cfg.apply_command("rm bin /bin/vi strataA:/usr/bin/vi").unwrap();
        assert!(cfg.get("/bin/vi").is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let mut cfg = CrossConfig::new();
        cfg.apply_command("add bin /bin/vi strataA:/usr/bin/vi").unwrap();
        cfg.apply_command("clear").unwrap();
        assert!(cfg.entries().is_empty());
    }

    #[test]
    fn add_rejects_relative_virtual_path() {
        let mut cfg = CrossConfig::new();
        assert!(cfg.apply_command("add bin bin/vi strataA:/usr/bin/vi").is_err());
    }
}
