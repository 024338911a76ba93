//! Threat findings and the aggregated report.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Severity of a single finding. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// High and Critical findings block execution.
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of risky pattern a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    DangerousImport,
    DynamicExecution,
    SandboxEscape,
    ExceptionSwallowing,
    InfiniteLoop,
    SystemAccessPattern,
    NetworkAccess,
    CryptoUsage,
    DangerousLiteral,
    Obfuscation,
    SuspiciousIdentifier,
    ResourceExhaustion,
    MalformedSource,
}

impl ThreatCategory {
    pub const ALL: [ThreatCategory; 13] = [
        ThreatCategory::DangerousImport,
        ThreatCategory::DynamicExecution,
        ThreatCategory::SandboxEscape,
        ThreatCategory::ExceptionSwallowing,
        ThreatCategory::InfiniteLoop,
        ThreatCategory::SystemAccessPattern,
        ThreatCategory::NetworkAccess,
        ThreatCategory::CryptoUsage,
        ThreatCategory::DangerousLiteral,
        ThreatCategory::Obfuscation,
        ThreatCategory::SuspiciousIdentifier,
        ThreatCategory::ResourceExhaustion,
        ThreatCategory::MalformedSource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::DangerousImport => "dangerous_import",
            ThreatCategory::DynamicExecution => "dynamic_execution",
            ThreatCategory::SandboxEscape => "sandbox_escape",
            ThreatCategory::ExceptionSwallowing => "exception_swallowing",
            ThreatCategory::InfiniteLoop => "infinite_loop",
            ThreatCategory::SystemAccessPattern => "system_access_pattern",
            ThreatCategory::NetworkAccess => "network_access",
            ThreatCategory::CryptoUsage => "crypto_usage",
            ThreatCategory::DangerousLiteral => "dangerous_literal",
            ThreatCategory::Obfuscation => "obfuscation",
            ThreatCategory::SuspiciousIdentifier => "suspicious_identifier",
            ThreatCategory::ResourceExhaustion => "resource_exhaustion",
            ThreatCategory::MalformedSource => "malformed_source",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single risky pattern located in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatFinding {
    pub severity: Severity,
    pub category: ThreatCategory,
    /// 1-based source line.
    pub line: usize,
    pub description: String,
    pub mitigation: String,
}

impl ThreatFinding {
    pub fn new(
        severity: Severity,
        category: ThreatCategory,
        line: usize,
        description: impl Into<String>,
        mitigation: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            line,
            description: description.into(),
            mitigation: mitigation.into(),
        }
    }
}

/// Result of scanning one script. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatReport {
    filename: String,
    findings: Vec<ThreatFinding>,
}

impl ThreatReport {
    pub(crate) fn new(filename: impl Into<String>, findings: Vec<ThreatFinding>) -> Self {
        Self {
            filename: filename.into(),
            findings,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn findings(&self) -> &[ThreatFinding] {
        &self.findings
    }

    /// True when nothing reaches High or Critical.
    pub fn is_safe(&self) -> bool {
        !self.findings.iter().any(|f| f.severity.is_blocking())
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    pub fn has_category(&self, category: ThreatCategory) -> bool {
        self.findings.iter().any(|f| f.category == category)
    }

    pub fn blocking_findings(&self) -> impl Iterator<Item = &ThreatFinding> {
        self.findings.iter().filter(|f| f.severity.is_blocking())
    }

    /// One-line summary that names categories and lines, never code.
    pub fn summary(&self) -> String {
        let Some(max) = self.max_severity() else {
            return "no findings".to_string();
        };
        let mut blocking: Vec<String> = self
            .blocking_findings()
            .map(|f| format!("{} (line {})", f.category, f.line))
            .collect();
        blocking.truncate(5);
        if blocking.is_empty() {
            format!("{} findings, max severity {}", self.findings.len(), max)
        } else {
            format!(
                "{} findings, max severity {}: {}",
                self.findings.len(),
                max,
                blocking.join(", ")
            )
        }
    }

    /// JSON view including the derived fields.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "filename": self.filename,
            "is_safe": self.is_safe(),
            "max_severity": self.max_severity(),
            "findings": self.findings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity, category: ThreatCategory) -> ThreatFinding {
        ThreatFinding::new(severity, category, 1, "d", "m")
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::High.is_blocking());
        assert!(!Severity::Medium.is_blocking());
    }

    #[test]
    fn medium_findings_are_safe() {
        let report = ThreatReport::new(
            "s.py",
            vec![
                finding(Severity::Medium, ThreatCategory::CryptoUsage),
                finding(Severity::Low, ThreatCategory::ExceptionSwallowing),
            ],
        );
        assert!(report.is_safe());
        assert_eq!(report.max_severity(), Some(Severity::Medium));
    }

    #[test]
    fn high_findings_are_unsafe() {
        let report = ThreatReport::new(
            "s.py",
            vec![finding(Severity::High, ThreatCategory::InfiniteLoop)],
        );
        assert!(!report.is_safe());
        assert!(report.summary().contains("infinite_loop (line 1)"));
    }

    #[test]
    fn empty_report() {
        let report = ThreatReport::new("s.py", Vec::new());
        assert!(report.is_safe());
        assert_eq!(report.max_severity(), None);
        assert_eq!(report.summary(), "no findings");
    }

    #[test]
    fn category_serializes_snake_case() {
        let value = serde_json::to_value(ThreatCategory::DangerousImport).unwrap();
        assert_eq!(value, serde_json::json!("dangerous_import"));
        let json = ThreatReport::new("a", Vec::new()).to_json();
        assert_eq!(json["is_safe"], serde_json::json!(true));
    }
}
