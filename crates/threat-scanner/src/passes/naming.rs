//! Suspicious identifier names.

use std::collections::HashSet;

use crate::finding::{Severity, ThreatCategory, ThreatFinding};
use crate::syntax::{SyntaxTree, TokenKind};

/// Whole identifier segments associated with malware tooling.
const SEGMENT_DENYLIST: &[&str] = &[
    "payload", "backdoor", "exploit", "shellcode", "keylogger", "rootkit", "trojan", "malware",
    "ransomware", "botnet", "exfil", "exfiltrate", "stealer", "dropper", "injector", "privesc",
    "spyware", "rat", "c2", "beacon",
];

/// Fragments that are suspicious even when glued into a longer word.
const SUBSTRING_DENYLIST: &[&str] = &["shellcode", "keylog", "backdoor", "exfiltrat", "rootkit"];

pub(crate) fn run(tree: &SyntaxTree, extra_denylist: &[String], out: &mut Vec<ThreatFinding>) {
    let mut seen: HashSet<(usize, &str)> = HashSet::new();
    for token in tree.tokens() {
        if token.kind != TokenKind::Name || !seen.insert((token.line, token.text.as_str())) {
            continue;
        }
        if let Some(hit) = denied_fragment(&token.text, extra_denylist) {
            out.push(ThreatFinding::new(
                Severity::Medium,
                ThreatCategory::SuspiciousIdentifier,
                token.line,
                format!("identifier `{}` contains `{hit}`", token.text),
                "Rename the identifier to describe its trading purpose",
            ));
        }
    }
}

fn denied_fragment(identifier: &str, extra_denylist: &[String]) -> Option<String> {
    let segments = segments(identifier);
    let denied = segments.iter().find(|segment| {
        SEGMENT_DENYLIST.contains(&segment.as_str())
            || extra_denylist.iter().any(|d| d.eq_ignore_ascii_case(segment))
    });
    if let Some(segment) = denied {
        return Some(segment.clone());
    }
    let lower = identifier.to_ascii_lowercase();
    SUBSTRING_DENYLIST
        .iter()
        .find(|fragment| lower.contains(*fragment))
        .map(|fragment| (*fragment).to_string())
}

/// Splits `snake_case`, `camelCase` and `HTTPServer`-style names into
/// lowercase segments.
fn segments(identifier: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in identifier.split('_').filter(|p| !p.is_empty()) {
        let chars: Vec<char> = part.chars().collect();
        let mut current = String::new();
        for (idx, &c) in chars.iter().enumerate() {
            let boundary = idx > 0
                && c.is_uppercase()
                && (chars[idx - 1].is_lowercase()
                    || chars[idx - 1].is_ascii_digit()
                    || chars.get(idx + 1).is_some_and(|n| n.is_lowercase()));
            if boundary && !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            current.extend(c.to_lowercase());
        }
        if !current.is_empty() {
            out.push(current);
        }
    }
    out
}
