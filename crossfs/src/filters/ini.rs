//! `ini` filter (spec §4.4): two line-level rewrites applied to the first
//! existing backing's text content.

use bedrock_core::error::{CoreError, CoreResult};

use super::{FilterEnv, ResolvedBacking};

/// The `strat` launcher, inserted after `Exec*=` so a cross-stratum desktop
/// entry re-enters the stratum it was read from before running its command.
const STRAT_PATH: &str = "/bedrock/bin/strat";

const EXEC_PREFIXES: &[&str] = &[
    "Exec=",
    "ExecReload=",
    "ExecStart=",
    "ExecStartPost=",
    "ExecStartPre=",
    "ExecStop=",
    "ExecStopPost=",
];

const EXPAND_PREFIXES: &[&str] = &["Icon=/", "Path=/", "TryExec=/"];

pub fn materialize(env: &FilterEnv<'_>, existing: &[ResolvedBacking]) -> CoreResult<Vec<u8>> {
    let backing = existing
        .first()
        .ok_or(CoreError::NotFound)?;
    let content = std::fs::read_to_string(&backing.confine()?)?;
    Ok(rewrite(&content, &backing.stratum, env.strata_root.to_str().unwrap_or("/bedrock/strata")).into_bytes())
}

/// Apply inject-strat and expand-path to every line of `content`.
pub fn rewrite(content: &str, stratum: &str, strata_root: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(b) => (b, "\n"),
            None => (line, ""),
        };
        if let Some(prefix) = EXEC_PREFIXES.iter().find(|p| body.starts_with(**p)) {
            out.push_str(prefix);
            out.push_str(STRAT_PATH);
            out.push(' ');
            out.push_str(stratum);
            out.push(' ');
            out.push_str(&body[prefix.len()..]);
        } else if let Some(prefix) = EXPAND_PREFIXES.iter().find(|p| body.starts_with(**p)) {
            // prefix includes the leading '/' of the absolute tail; keep it
            // as the first byte of the expanded path.
            let key_len = prefix.len() - 1;
            out.push_str(&prefix[..key_len]);
            out.push_str(strata_root);
            out.push_str(&body[key_len..]);
        } else {
            out.push_str(body);
        }
        out.push_str(newline);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_lines_get_strat_prefix() {
        let input = "Exec=/usr/bin/foo\nTryExec=/usr/bin/foo\n";
        let out = rewrite(input, "strataA", "/bedrock/strata");
        assert_eq!(
            out,
            "Exec=/bedrock/bin/strat strataA /usr/bin/foo\nTryExec=/bedrock/strata/strataA/usr/bin/foo\n"
        );
    }

    #[test]
    fn unrelated_lines_pass_through() {
        let input = "Name=Foo\nComment=bar\n";
        assert_eq!(rewrite(input, "strataA", "/bedrock/strata"), input);
    }

    #[test]
    fn no_trailing_newline_is_preserved() {
        let input = "Icon=/usr/share/icons/foo.png";
        let out = rewrite(input, "strataA", "/bedrock/strata");
        assert_eq!(out, "Icon=/bedrock/strata/strataA/usr/share/icons/foo.png");
    }
}
