//! Remote Access Gate (spec §4.6): host trust matching, per-operation
//! permission bits, and executable allow/deny globs. New relative to the
//! teacher (`validate_registry_path` is path-traversal defense, not a
//! trust gate) but grounded in that function's defense-in-depth style —
//! explicit named checks, each failing with its own reason.

use crate::types::{RemoteAccessConfig, RemoteOperation};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(String),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Evaluate whether `host` may perform `op` against `executable`, per
/// spec §4.6's ordered checks: disabled surface, trust, permission bit,
/// then the executable allow/deny lists.
pub fn evaluate(
    config: &RemoteAccessConfig,
    host: &str,
    op: RemoteOperation,
    executable: Option<&str>,
) -> GateDecision {
    if !config.enabled {
        return GateDecision::Deny("remote access is disabled".to_string());
    }

    if !host_is_trusted(config, host) {
        warn!(host, "rejected remote request from untrusted host");
        return GateDecision::Deny(format!("host `{host}` is not in the trusted host list"));
    }

    if !config.allows(op) {
        return GateDecision::Deny(format!("operation {op:?} is not permitted remotely"));
    }

    if let Some(exe) = executable {
        if let GateDecision::Deny(reason) = evaluate_executable(config, exe) {
            return GateDecision::Deny(reason);
        }
    }

    GateDecision::Allow
}

/// Trusted-host matching: `*` matches any sequence not containing `.`,
/// exact equality otherwise, empty pattern matches only an empty host
/// (spec §4.6). An empty trusted-host list never trusts anything.
fn host_is_trusted(config: &RemoteAccessConfig, host: &str) -> bool {
    config
        .trusted_hosts
        .iter()
        .any(|pattern| host_pattern_matches(pattern, host))
}

fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern.is_empty() {
        return host.is_empty();
    }
    let regex_src = format!("^{}$", glob_to_regex(pattern, "[^.]*"));
    regex_lite_match(&regex_src, host)
}

/// Executable allow/deny globs: `*` matches any sequence (including path
/// separators), `?` matches a single character (spec §4.6). A blacklist
/// match always denies. `evaluate_executable` only ever runs once the
/// caller's host-trust check has already passed (spec §4.6 item 3: the
/// empty-whitelist refusal applies to untrusted clients, not trusted ones),
/// so an empty whitelist here means "no additional restriction" rather
/// than "deny everything" — a trusted host with no whitelist configured
/// may use any non-blacklisted executable.
fn evaluate_executable(config: &RemoteAccessConfig, executable: &str) -> GateDecision {
    if config
        .executable_blacklist
        .iter()
        .any(|pat| exe_pattern_matches(pat, executable))
    {
        return GateDecision::Deny(format!("executable `{executable}` is blacklisted"));
    }

    if config.executable_whitelist.is_empty() {
        return GateDecision::Allow;
    }

    if config
        .executable_whitelist
        .iter()
        .any(|pat| exe_pattern_matches(pat, executable))
    {
        GateDecision::Allow
    } else {
        GateDecision::Deny(format!("executable `{executable}` is not whitelisted"))
    }
}

fn exe_pattern_matches(pattern: &str, value: &str) -> bool {
    let regex_src = format!("^{}$", glob_to_regex(pattern, "."));
    regex_lite_match(&regex_src, value)
}

/// Translate a shell-style glob into an anchored regex body. `star_class`
/// is the character class `*` expands to (`.` for executables, so `*`
/// crosses path separators; `[^.]*` for hostnames, so `*` stops at a dot).
fn glob_to_regex(pattern: &str, star_class: &str) -> String {
    let mut out = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(&format!("{star_class}*")),
            '?' => out.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Minimal anchored-regex matcher sufficient for the glob subset above
/// (literal runs plus `.`/`.*`/`[^.]*`), avoiding a dependency on a full
/// regex engine for what is otherwise a simple pattern language.
fn regex_lite_match(pattern: &str, text: &str) -> bool {
    let body = pattern.trim_start_matches('^').trim_end_matches('$');
    let tokens = tokenize(body);
    matches_tokens(&tokens, text.as_bytes())
}

enum Token {
    Literal(char),
    AnyChar,
    AnyRun,       // .*
    AnyRunNoDot,  // [^.]*
}

fn tokenize(body: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    tokens.push(Token::Literal(escaped));
                }
            }
            '.' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::AnyRun);
                } else {
                    tokens.push(Token::AnyChar);
                }
            }
            '[' => {
                // only the `[^.]*` construct is ever produced by glob_to_regex
                let rest: String = chars.by_ref().take_while(|&c| c != ']').collect();
                debug_assert_eq!(rest, "^.");
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::AnyRunNoDot);
                }
            }
            c => tokens.push(Token::Literal(c)),
        }
    }
    tokens
}

fn matches_tokens(tokens: &[Token], text: &[u8]) -> bool {
    match tokens.split_first() {
        None => text.is_empty(),
        Some((Token::Literal(c), rest)) => {
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            text.starts_with(encoded) && matches_tokens(rest, &text[encoded.len()..])
        }
        Some((Token::AnyChar, rest)) => {
            !text.is_empty() && matches_tokens(rest, &text[1..])
        }
        Some((Token::AnyRun, rest)) => (0..=text.len()).any(|i| matches_tokens(rest, &text[i..])),
        Some((Token::AnyRunNoDot, rest)) => (0..=text.len())
            .take_while(|&i| !text[..i].contains(&b'.'))
            .any(|i| matches_tokens(rest, &text[i..])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteAccessConfig {
        RemoteAccessConfig {
            enabled: true,
            trusted_hosts: vec!["ci-*".to_string(), "localhost".to_string()],
            allow_start: true,
            executable_whitelist: vec!["/usr/bin/*".to_string()],
            executable_blacklist: vec!["*rm*".to_string()],
            ..RemoteAccessConfig::default()
        }
    }

    #[test]
    fn star_does_not_cross_dots_in_hostnames() {
        assert!(host_pattern_matches("ci-*", "ci-worker"));
        assert!(!host_pattern_matches("ci-*", "ci-worker.internal"));
    }

    #[test]
    fn empty_pattern_matches_only_empty_host() {
        assert!(host_pattern_matches("", ""));
        assert!(!host_pattern_matches("", "localhost"));
    }

    #[test]
    fn allows_trusted_host_with_permitted_op_and_whitelisted_exe() {
        let cfg = config();
        let decision = evaluate(&cfg, "ci-worker", RemoteOperation::Start, Some("/usr/bin/node"));
        assert_eq!(decision, GateDecision::Allow);
    }

    #[test]
    fn denies_untrusted_host() {
        let cfg = config();
        let decision = evaluate(&cfg, "evil.example.com", RemoteOperation::Start, None);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn blacklist_wins_over_whitelist() {
        let cfg = config();
        let decision = evaluate(&cfg, "localhost", RemoteOperation::Start, Some("/usr/bin/rm"));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn empty_whitelist_allows_trusted_host_unless_blacklisted() {
        let mut cfg = config();
        cfg.executable_whitelist.clear();
        let decision = evaluate(&cfg, "localhost", RemoteOperation::Start, Some("/usr/bin/node"));
        assert!(decision.is_allowed());

        let blacklisted = evaluate(&cfg, "localhost", RemoteOperation::Start, Some("/usr/bin/rm"));
        assert!(!blacklisted.is_allowed());
    }

    #[test]
    fn empty_whitelist_still_blocked_by_untrusted_host() {
        let mut cfg = config();
        cfg.executable_whitelist.clear();
        let decision = evaluate(&cfg, "evil.example.com", RemoteOperation::Start, Some("/usr/bin/node"));
        assert!(!decision.is_allowed());
    }
}
