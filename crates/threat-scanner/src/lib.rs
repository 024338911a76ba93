//! Static threat analysis for untrusted strategy scripts.
//!
//! The scanner never executes anything. It lexes the script into a small
//! statement tree, runs five independent passes (structural, lexical,
//! obfuscation, naming, resource shape) and returns an ordered
//! [`ThreatReport`]. Whether a report blocks execution is the caller's call;
//! [`ThreatReport::is_safe`] is false once any finding reaches `High`.

pub mod finding;
mod passes;
pub mod scanner;
pub mod syntax;

pub use finding::{Severity, ThreatCategory, ThreatFinding, ThreatReport};
pub use scanner::{analyze, ScannerConfig, ThreatScanner, DEFAULT_LARGE_ALLOCATION_THRESHOLD};
