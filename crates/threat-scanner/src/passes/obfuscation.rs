//! Encoded-payload detection.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};
use base64::Engine as _;
use lazy_static::lazy_static;
use regex::Regex;

use crate::finding::{Severity, ThreatCategory, ThreatFinding};

lazy_static! {
    static ref BASE64_RUN: Regex = Regex::new(r"[A-Za-z0-9+/_-]{60,}={0,2}").unwrap();
    static ref HEX_ESCAPES: Regex = Regex::new(r"(?:\\x[0-9a-fA-F]{2}){4,}").unwrap();
    static ref UNICODE_ESCAPES: Regex = Regex::new(r"(?:\\u[0-9a-fA-F]{4}){3,}").unwrap();
    static ref CHR_CHAIN: Regex =
        Regex::new(r"\bchr\(\s*\d+\s*\)(?:\s*\+\s*chr\(\s*\d+\s*\)){2,}").unwrap();
}

pub(crate) fn run(source: &str, out: &mut Vec<ThreatFinding>) {
    for (idx, text) in source.lines().enumerate() {
        if text.trim_start().starts_with('#') {
            continue;
        }
        let line = idx + 1;

        if let Some(run) = BASE64_RUN.find(text) {
            let (severity, description) = if decodes(run.as_str()) {
                (Severity::High, "long base64 literal that decodes to a payload")
            } else {
                (Severity::Medium, "long base64-like literal")
            };
            out.push(ThreatFinding::new(
                severity,
                ThreatCategory::Obfuscation,
                line,
                description,
                "Ship readable source; encoded blobs cannot be reviewed",
            ));
        }
        if HEX_ESCAPES.is_match(text) {
            out.push(ThreatFinding::new(
                Severity::High,
                ThreatCategory::Obfuscation,
                line,
                "run of hex escape sequences",
                "Write string content as plain text",
            ));
        }
        if UNICODE_ESCAPES.is_match(text) {
            out.push(ThreatFinding::new(
                Severity::Medium,
                ThreatCategory::Obfuscation,
                line,
                "run of unicode escape sequences",
                "Write string content as plain text",
            ));
        }
        if CHR_CHAIN.is_match(text) {
            out.push(ThreatFinding::new(
                Severity::Medium,
                ThreatCategory::Obfuscation,
                line,
                "string assembled from chr() codes",
                "Write string content as plain text",
            ));
        }
    }
}

/// Pure hex runs (digests, keys) are not treated as decodable payloads.
fn decodes(run: &str) -> bool {
    if run.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    STANDARD.decode(run).is_ok()
        || STANDARD_NO_PAD.decode(run.trim_end_matches('=')).is_ok()
        || URL_SAFE.decode(run).is_ok()
}
