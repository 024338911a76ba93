use proptest::prelude::*;
use threat_scanner::{analyze, ScannerConfig, Severity, ThreatCategory, ThreatScanner};

#[test]
fn socket_client_is_unsafe() {
    let src = "import socket\ns = socket.socket()\ns.connect(('203.0.113.9', 9001))\n";
    let report = analyze(src, "exfil.py");

    assert!(!report.is_safe());
    assert_eq!(report.max_severity(), Some(Severity::Critical));
    let first = &report.findings()[0];
    assert_eq!(first.category, ThreatCategory::DangerousImport);
    assert_eq!(first.line, 1);
    assert!(report.has_category(ThreatCategory::NetworkAccess));
}

#[test]
fn infinite_loop_without_break_is_flagged() {
    let src = "def run(x, p):\n    total = 0\n    while True:\n        total = total + x\n";
    let report = analyze(src, "spin.py");

    assert!(!report.is_safe());
    let loops: Vec<_> = report
        .findings()
        .iter()
        .filter(|f| f.category == ThreatCategory::InfiniteLoop)
        .collect();
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].severity, Severity::High);
    assert_eq!(loops[0].line, 3);
}

#[test]
fn deeply_nested_expression_is_blocked() {
    let src = format!("def f(x, p):\n    return {}x{}\n", "(".repeat(20_000), ")".repeat(20_000));
    let report = analyze(&src, "deep.py");

    assert!(!report.is_safe());
    assert!(report
        .findings()
        .iter()
        .any(|f| f.category == ThreatCategory::ResourceExhaustion && f.line == 2));
}

#[test]
fn doubling_strategy_is_clean() {
    let report = analyze("def f(x, p):\n    return x * 2\n", "double.py");
    assert!(report.is_safe());
    assert!(report.findings().is_empty());
    assert_eq!(report.summary(), "no findings");
}

#[test]
fn realistic_strategy_is_clean() {
    let src = r#"
def signal(prices, p):
    fast = sum(prices[-p['fast']:]) / p['fast']
    slow = sum(prices[-p['slow']:]) / p['slow']
    return 1 if fast > slow else -1
"#;
    let report = analyze(src, "momentum.py");
    assert!(report.findings().is_empty(), "{:?}", report.findings());
}

#[test]
fn escape_chain_is_blocked() {
    let src = "def f(x, p):\n    return [c for c in ().__class__.__base__.__subclasses__()]\n";
    let report = analyze(src, "escape.py");
    assert!(!report.is_safe());
    assert!(report
        .blocking_findings()
        .all(|f| f.category == ThreatCategory::SandboxEscape));
}

#[test]
fn summary_names_categories_but_not_code() {
    let src = "x = eval(user_code)\n";
    let report = analyze(src, "dyn.py");
    let summary = report.summary();
    assert!(summary.contains("dynamic_execution (line 1)"));
    assert!(!summary.contains("user_code"));
}

#[test]
fn report_json_carries_derived_fields() {
    let report = analyze("import subprocess\n", "spawn.py");
    let json = report.to_json();
    assert_eq!(json["filename"], "spawn.py");
    assert_eq!(json["is_safe"], false);
    assert_eq!(json["max_severity"], "critical");
    assert_eq!(json["findings"][0]["category"], "dangerous_import");
}

#[test]
fn threshold_is_configurable() {
    let config = ScannerConfig {
        large_allocation_threshold: 1_000,
        ..ScannerConfig::default()
    };
    let src = "window = [0] * 5000\n";
    assert!(analyze(src, "w.py").is_safe());
    assert!(!ThreatScanner::new(config).analyze(src, "w.py").is_safe());
}

proptest! {
    #[test]
    fn analysis_is_deterministic(src in "[a-z_()=:. \n0-9'\"*#\\[\\]+-]{0,200}") {
        let scanner = ThreatScanner::default();
        let first = scanner.analyze(&src, "p.py");
        let second = scanner.analyze(&src, "p.py");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn findings_stay_ordered(src in "(import os\n|x = 1\n|while True: pass\n|y = eval(z)\n|  \n){0,12}") {
        let report = analyze(&src, "p.py");
        let lines: Vec<usize> = report.findings().iter().map(|f| f.line).collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        prop_assert_eq!(lines, sorted);
    }
}
