//! `service` filter (spec §4.4): the same inject-strat/expand-path rewrites
//! as `ini`, plus translation between two init-system unit flavors when the
//! host's init type differs from the backing unit's.
//!
//! The original bedrock-linux source populates this translation in only one
//! direction; per SPEC_FULL.md's Open Question decision we restrict it to
//! the one documented pair (systemd unit ⇄ OpenRC init script) and fail
//! closed with `Unsupported` for anything else, rather than guess.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use bedrock_core::error::{CoreError, CoreResult};

use super::ini;
use super::{FilterEnv, InitFlavor, ResolvedBacking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitFlavor {
    Systemd,
    OpenRc,
    Unknown,
}

fn detect_flavor(content: &str) -> UnitFlavor {
    if content.contains("[Unit]") || content.contains("[Service]") {
        UnitFlavor::Systemd
    } else if content.contains("openrc-run") {
        UnitFlavor::OpenRc
    } else {
        UnitFlavor::Unknown
    }
}

/// Cached translation, keyed by backing path and the mtime it was derived
/// from, so repeated reads of an unchanged file skip re-synthesis.
static TRANSLATION_CACHE: Mutex<Option<HashMap<(PathBuf, SystemTime), String>>> = Mutex::new(None);

pub fn materialize(env: &FilterEnv<'_>, existing: &[ResolvedBacking]) -> CoreResult<Vec<u8>> {
    let backing = existing.first().ok_or(CoreError::NotFound)?;
    let confined = backing.confine()?;
    let raw = std::fs::read_to_string(&confined)?;
    let backing_flavor = detect_flavor(&raw);
    let host_flavor = match env.host_init {
        InitFlavor::Systemd => UnitFlavor::Systemd,
        InitFlavor::OpenRc => UnitFlavor::OpenRc,
    };

    let content = if backing_flavor == host_flavor || backing_flavor == UnitFlavor::Unknown {
        raw
    } else {
        translate_cached(&backing.path, &confined, &raw, backing_flavor, host_flavor)?
    };

    Ok(ini::rewrite(
        &content,
        &backing.stratum,
        env.strata_root.to_str().unwrap_or("/bedrock/strata"),
    )
    .into_bytes())
}

/// `cache_key` is the backing's stable display path, used only to key the
/// cache; the mtime used as part of that key (and the actual read) comes
/// from `confined`, the chroot-safe alias, so the cache never keys off an
/// unconfined stat.
fn translate_cached(
    cache_key: &std::path::Path,
    confined: &bedrock_core::resolve::ConfinedPath,
    raw: &str,
    from: UnitFlavor,
    to: UnitFlavor,
) -> CoreResult<String> {
    let mtime = std::fs::metadata(confined)?.modified()?;
    let key = (cache_key.to_path_buf(), mtime);

    let mut guard = TRANSLATION_CACHE.lock().unwrap_or_else(|p| p.into_inner());
    let cache = guard.get_or_insert_with(HashMap::new);
    if let Some(hit) = cache.get(&key) {
        return Ok(hit.clone());
    }
    let translated = translate(raw, from, to)?;
    cache.insert(key, translated.clone());
    Ok(translated)
}

fn translate(raw: &str, from: UnitFlavor, to: UnitFlavor) -> CoreResult<String> {
    match (from, to) {
        (UnitFlavor::Systemd, UnitFlavor::OpenRc) => Ok(systemd_to_openrc(raw)),
        (UnitFlavor::OpenRc, UnitFlavor::Systemd) => Ok(openrc_to_systemd(raw)),
        _ => Err(CoreError::Unsupported),
    }
}

fn systemd_to_openrc(raw: &str) -> String {
    let exec = raw
        .lines()
        .find_map(|l| l.strip_prefix("ExecStart="))
        .unwrap_or("");
    let description = raw
        .lines()
        .find_map(|l| l.strip_prefix("Description="))
        .unwrap_or("");
    format!(
        "#!/sbin/openrc-run\n# translated from a systemd unit\ndescription=\"{description}\"\ncommand=\"{exec}\"\n"
    )
}

fn openrc_to_systemd(raw: &str) -> String {
    let command = raw
        .lines()
        .find_map(|l| l.strip_prefix("command=\"").and_then(|s| s.strip_suffix('"')))
        .unwrap_or("");
    let description = raw
        .lines()
        .find_map(|l| l.strip_prefix("description=\"").and_then(|s| s.strip_suffix('"')))
        .unwrap_or("");
    format!("[Unit]\nDescription={description}\n\n[Service]\nExecStart={command}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_flavor_is_passthrough() {
        let raw = "[Unit]\nDescription=x\n\n[Service]\nExecStart=/usr/bin/foo\n";
        assert_eq!(detect_flavor(raw), UnitFlavor::Systemd);
    }

    #[test]
    fn systemd_to_openrc_extracts_exec() {
        let raw = "[Unit]\nDescription=demo\n\n[Service]\nExecStart=/usr/bin/foo\n";
        let out = systemd_to_openrc(raw);
        assert!(out.contains("command=\"/usr/bin/foo\""));
        assert!(out.contains("description=\"demo\""));
    }

    #[test]
    fn unknown_flavor_translation_fails_closed() {
        assert!(matches!(
            translate("garbage", UnitFlavor::Unknown, UnitFlavor::Systemd),
            Err(CoreError::Unsupported)
        ));
    }
}
