//! `font` filter (spec §4.4): merges `fonts.dir`/`fonts.alias` across every
//! existing backing, earlier backings winning on key collision.

use std::collections::BTreeMap;

use bedrock_core::error::{CoreError, CoreResult};

use super::ResolvedBacking;

pub fn materialize(existing: &[ResolvedBacking]) -> CoreResult<Vec<u8>> {
    if existing.is_empty() {
        return Err(CoreError::NotFound);
    }
    let is_fonts_dir = existing[0]
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == "fonts.dir")
        .unwrap_or(false);

    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for backing in existing {
        let Ok(confined) = backing.confine() else {
            continue;
        };
        let Ok(content) = std::fs::read_to_string(&confined) else {
            continue;
        };
        for line in content.lines() {
            if line.starts_with('!') || line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            merged.entry(key.to_string()).or_insert_with(|| value.trim_start().to_string());
        }
    }

    let mut out = String::new();
    if is_fonts_dir {
        out.push_str(&merged.len().to_string());
        out.push('\n');
    }
    for (key, value) in &merged {
        out.push_str(key);
        out.push(' ');
        out.push_str(value);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrock_core::stratum::StratumPool;
    use std::io::Write;

    fn write_tmp(pool: &StratumPool, name: &str, content: &str) -> ResolvedBacking {
        let handle = pool.get("s").unwrap();
        let mut f = std::fs::File::create(handle.root().join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        ResolvedBacking {
            stratum: "s".into(),
            path: handle.root().join(name),
            handle,
            candidate: std::path::PathBuf::from("/").join(name),
        }
    }

    #[test]
    fn earlier_backing_wins_and_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("s")).unwrap();
        let pool = StratumPool::new(dir.path().to_path_buf());
        let a = write_tmp(&pool, "fonts.dir", "2\nfoo.pcf -foo-foo\n!comment\nbar.pcf -bar-bar\n");
        let b = write_tmp(&pool, "fonts2.dir", "foo.pcf -SHOULD-NOT-WIN\nbaz.pcf -baz-baz\n");
        let merged = materialize(&[a, b]).unwrap();
        let text = String::from_utf8(merged).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "3");
        let rest: Vec<&str> = lines.collect();
        assert!(rest.contains(&"bar.pcf -bar-bar"));
        assert!(rest.contains(&"baz.pcf -baz-baz"));
        assert!(rest.iter().any(|l| l.starts_with("foo.pcf -foo-foo")));
    }
}
