//! Scanner entry point: runs every pass and assembles the report.

use std::cmp::Reverse;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::finding::{Severity, ThreatCategory, ThreatFinding, ThreatReport};
use crate::passes::{lexical, naming, obfuscation, resource, structural};
use crate::syntax::{parse, SyntaxIssue};

/// Default size at which a constant allocation is considered hostile.
pub const DEFAULT_LARGE_ALLOCATION_THRESHOLD: u64 = 10_000_000;

/// Tunables for the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Replaces the severity of every finding in a category.
    pub severity_overrides: HashMap<ThreatCategory, Severity>,
    pub large_allocation_threshold: u64,
    /// Extra identifier segments treated as suspicious.
    pub extra_identifier_denylist: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            severity_overrides: HashMap::new(),
            large_allocation_threshold: DEFAULT_LARGE_ALLOCATION_THRESHOLD,
            extra_identifier_denylist: Vec::new(),
        }
    }
}

/// Pure static analyzer. Cheap to clone and safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct ThreatScanner {
    config: ScannerConfig,
}

impl ThreatScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scans `code` and returns an ordered, deduplicated report.
    ///
    /// Never fails: unparseable input still produces a report, with a
    /// `malformed_source` finding describing the first problem.
    pub fn analyze(&self, code: &str, filename: &str) -> ThreatReport {
        let tree = parse(code);
        let mut findings = Vec::new();

        structural::run(&tree, &mut findings);
        lexical::run(code, &mut findings);
        obfuscation::run(code, &mut findings);
        naming::run(&tree, &self.config.extra_identifier_denylist, &mut findings);
        resource::run(&tree, self.config.large_allocation_threshold, &mut findings);

        if let Some(issue) = tree.issues.first() {
            findings.push(malformed(issue));
        }

        for finding in &mut findings {
            if let Some(severity) = self.config.severity_overrides.get(&finding.category) {
                finding.severity = *severity;
            }
        }

        findings.sort_by(|a, b| {
            (a.line, Reverse(a.severity), a.category, &a.description, &a.mitigation).cmp(&(
                b.line,
                Reverse(b.severity),
                b.category,
                &b.description,
                &b.mitigation,
            ))
        });
        findings.dedup();

        let report = ThreatReport::new(filename, findings);
        debug!(
            filename,
            findings = report.findings().len(),
            max_severity = ?report.max_severity(),
            is_safe = report.is_safe(),
            "script scanned"
        );
        report
    }
}

/// Scans with the default configuration.
pub fn analyze(code: &str, filename: &str) -> ThreatReport {
    ThreatScanner::default().analyze(code, filename)
}

fn malformed(issue: &SyntaxIssue) -> ThreatFinding {
    let description = match issue {
        SyntaxIssue::UnterminatedString { .. } => "unterminated string literal",
        SyntaxIssue::UnbalancedBracket { .. } => "unbalanced closing bracket",
    };
    ThreatFinding::new(
        Severity::Low,
        ThreatCategory::MalformedSource,
        issue.line(),
        description,
        "Fix the syntax error; analysis of the rest of the file is best-effort",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strategy_has_no_findings() {
        let report = analyze("def f(x, p):\n    return x * 2\n", "double.py");
        assert!(report.is_safe());
        assert!(report.findings().is_empty());
        assert_eq!(report.filename(), "double.py");
    }

    #[test]
    fn findings_are_ordered_by_line_then_severity() {
        let src = "import hashlib\nimport os\n";
        let report = analyze(src, "s.py");
        let shape: Vec<(usize, Severity)> =
            report.findings().iter().map(|f| (f.line, f.severity)).collect();
        assert_eq!(shape, vec![(1, Severity::Medium), (2, Severity::Critical)]);
    }

    #[test]
    fn overrides_replace_category_severity() {
        let mut config = ScannerConfig::default();
        config
            .severity_overrides
            .insert(ThreatCategory::CryptoUsage, Severity::High);
        let report = ThreatScanner::new(config).analyze("import hashlib\n", "s.py");
        assert!(!report.is_safe());
        assert_eq!(report.max_severity(), Some(Severity::High));
    }

    #[test]
    fn malformed_source_is_reported_once() {
        let report = analyze("x = 'a\ny = 'b\nz = )\n", "bad.py");
        let malformed: Vec<&ThreatFinding> = report
            .findings()
            .iter()
            .filter(|f| f.category == ThreatCategory::MalformedSource)
            .collect();
        assert_eq!(malformed.len(), 1);
        assert_eq!(malformed[0].line, 1);
        assert_eq!(malformed[0].severity, Severity::Low);
        assert!(report.is_safe());
    }

    #[test]
    fn identical_findings_are_deduplicated() {
        let report = analyze("import os; import os\n", "dup.py");
        assert_eq!(report.findings().len(), 1);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ScannerConfig =
            serde_json::from_str(r#"{"severity_overrides": {"crypto_usage": "low"}}"#).unwrap();
        assert_eq!(config.large_allocation_threshold, DEFAULT_LARGE_ALLOCATION_THRESHOLD);
        assert_eq!(
            config.severity_overrides.get(&ThreatCategory::CryptoUsage),
            Some(&Severity::Low)
        );
    }
}
