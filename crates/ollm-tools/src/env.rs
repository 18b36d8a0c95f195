// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

/// Variables always passed through to tool subprocesses.
const DEFAULT_ALLOW: &[&str] = &["PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_*"];

/// Name patterns that are stripped unless explicitly allowed.
const DEFAULT_DENY: &[&str] = &[
    "*_KEY",
    "*_SECRET",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL",
    "AWS_*",
    "GITHUB_*",
];

/// Allow/deny rule set for filtering the environment handed to tool
/// subprocesses.
///
/// A variable passes when its name matches an allow pattern OR matches no
/// deny pattern.  Patterns are shell-style globs over variable names (`*`
/// and `?` only); a pattern without wildcards is an exact name.
///
/// The sanitizer is pure: it never mutates the parent environment, and the
/// same input environment and rules always produce the same output.
#[derive(Debug)]
pub struct EnvRules {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl Default for EnvRules {
    fn default() -> Self {
        Self::new(&[], &[], false)
    }
}

impl EnvRules {
    /// Build a rule set from configuration.
    ///
    /// `allow_extra` and `deny_extra` add to the built-in defaults;
    /// `clear_defaults` drops the defaults entirely.  An invalid pattern is
    /// logged once and skipped — the defaults stay in effect in its place.
    pub fn new(allow_extra: &[String], deny_extra: &[String], clear_defaults: bool) -> Self {
        let mut allow_patterns: Vec<&str> = Vec::new();
        let mut deny_patterns: Vec<&str> = Vec::new();
        if !clear_defaults {
            allow_patterns.extend(DEFAULT_ALLOW);
            deny_patterns.extend(DEFAULT_DENY);
        }
        allow_patterns.extend(allow_extra.iter().map(String::as_str));
        deny_patterns.extend(deny_extra.iter().map(String::as_str));

        let compile = |patterns: &[&str], list: &str| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| match glob_to_regex(p) {
                    Some(re) => Some(re),
                    None => {
                        warn!(pattern = %p, list, "ignoring invalid environment pattern");
                        None
                    }
                })
                .collect()
        };

        Self {
            allow: compile(&allow_patterns, "allow"),
            deny: compile(&deny_patterns, "deny"),
        }
    }

    /// Whether a variable of this name survives sanitization.
    pub fn passes(&self, name: &str) -> bool {
        if self.allow.iter().any(|re| re.is_match(name)) {
            return true;
        }
        !self.deny.iter().any(|re| re.is_match(name))
    }

    /// Filter an environment.  The output is an ordered map so repeated runs
    /// over the same input are byte-identical.
    pub fn sanitize(
        &self,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> BTreeMap<String, String> {
        env.into_iter()
            .filter(|(name, _)| self.passes(name))
            .collect()
    }

    /// Replace every occurrence of a secret value in `text` with a redaction
    /// marker.  A value is secret when its variable name does not pass these
    /// rules.  Values shorter than four bytes are skipped — replacing them
    /// would mangle unrelated text far more often than it would protect
    /// anything.
    pub fn redact<'a>(
        &self,
        text: &str,
        env: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> String {
        let mut out = text.to_string();
        for (name, value) in env {
            if value.len() >= 4 && !self.passes(name) && out.contains(value.as_str()) {
                out = out.replace(value.as_str(), "[redacted]");
            }
        }
        out
    }
}

/// Convert a shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
