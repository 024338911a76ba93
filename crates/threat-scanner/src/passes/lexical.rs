//! Line-oriented pattern pass over the raw source.

use lazy_static::lazy_static;
use regex::Regex;

use crate::finding::{Severity, ThreatCategory, ThreatFinding};

struct LexicalRule {
    pattern: Regex,
    severity: Severity,
    category: ThreatCategory,
    description: &'static str,
    mitigation: &'static str,
}

impl LexicalRule {
    fn new(
        pattern: &str,
        severity: Severity,
        category: ThreatCategory,
        description: &'static str,
        mitigation: &'static str,
    ) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("lexical rule pattern is valid"),
            severity,
            category,
            description,
            mitigation,
        }
    }
}

lazy_static! {
    static ref LEXICAL_RULES: Vec<LexicalRule> = vec![
        LexicalRule::new(
            r"/etc/|/proc/|/sys/|/dev/|/root/|\.ssh\b",
            Severity::High,
            ThreatCategory::SystemAccessPattern,
            "reference to a host system path",
            "Strategies must not touch host paths; use the data passed in parameters",
        ),
        LexicalRule::new(
            r"\bos\.(?:system|popen|exec\w*|spawn\w*|fork|kill)\b|\bsubprocess\.\w+|\bpty\.spawn\b|\bcommands\.getoutput\b|/bin/(?:ba|z|da)?sh\b",
            Severity::Critical,
            ThreatCategory::SystemAccessPattern,
            "shell or process invocation",
            "Remove process spawning; strategies run without a shell",
        ),
        LexicalRule::new(
            r"(?i)\b(?:https?|ftp|wss?)://|\bsocket\.(?:socket|create_connection|getaddrinfo)\b|\burllib\d?\.\w+|\brequests\.(?:get|post|put|patch|delete|head|request|session|Session)\b|\bhttp\.client\b|\bsmtplib\.\w+|\bparamiko\.\w+",
            Severity::High,
            ThreatCategory::NetworkAccess,
            "network client construct or URL",
            "Market data is supplied through parameters; outbound network access is unavailable",
        ),
        LexicalRule::new(
            r"\b(?:hashlib|hmac|Crypto|Cryptodome|cryptography|nacl|base64|binascii|codecs|zlib|secrets)\b",
            Severity::Medium,
            ThreatCategory::CryptoUsage,
            "cryptography or encoding library usage",
            "Confirm the encoding step is needed; it is a common way to hide payloads",
        ),
        LexicalRule::new(
            r"\brm\s+-[a-zA-Z]*[rf]|/dev/tcp/|\bmkfifo\b|\bnc\s+-[a-zA-Z]*[elp]|:\(\)\s*\{\s*:\|:",
            Severity::Critical,
            ThreatCategory::DangerousLiteral,
            "destructive or reverse-shell command literal",
            "Remove shell command text from the strategy",
        ),
        LexicalRule::new(
            r"\bcurl\s|\bwget\s|\bchmod\s+(?:0?777|[ugoa]*\+s)\b|\bsudo\s|\bchown\s",
            Severity::High,
            ThreatCategory::DangerousLiteral,
            "download or privilege-changing command literal",
            "Remove shell command text from the strategy",
        ),
    ];
}

pub(crate) fn run(source: &str, out: &mut Vec<ThreatFinding>) {
    for (idx, text) in source.lines().enumerate() {
        if text.trim_start().starts_with('#') {
            continue;
        }
        for rule in LEXICAL_RULES.iter() {
            if rule.pattern.is_match(text) {
                out.push(ThreatFinding::new(
                    rule.severity,
                    rule.category,
                    idx + 1,
                    rule.description,
                    rule.mitigation,
                ));
            }
        }
    }
}
