//! Dispatcher command templating.
//!
//! Placeholders are `%(name)u` (URL-encoded) and `%(name)x` (shell-quoted)
//! for `domain`, `type`, `maxtime` and `maxmem`. Substitution is a single
//! pass, so substituted values are never re-expanded.

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Values substituted into the dispatcher template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchArgs<'a> {
    pub domain: &'a str,
    pub job_type: &'a str,
    pub maxtime: u64,
    pub maxmem: &'a str,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"%\((domain|type|maxtime|maxmem)\)([ux])")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Fills the placeholders of `template` with `args`.
pub fn build_command(template: &str, args: &DispatchArgs<'_>) -> String {
    let maxtime = args.maxtime.to_string();
    placeholder_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            let value = match &caps[1] {
                "domain" => args.domain,
                "type" => args.job_type,
                "maxtime" => maxtime.as_str(),
                _ => args.maxmem,
            };
            match &caps[2] {
                "u" => urlencoding::encode(value).into_owned(),
                _ => shell_escape(value),
            }
        })
        .into_owned()
}

/// Quotes `arg` as one POSIX shell word.
pub fn shell_escape(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
