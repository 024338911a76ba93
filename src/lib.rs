//! # Strategy Sandbox
//!
//! Runs small, untrusted trading-strategy scripts on shared infrastructure.
//! Scripts are scanned statically before anything runs, then executed under
//! the strongest isolation tier the host offers (container, cgroup v2, or
//! in-process rlimits) while a monitor watches their resource use.
//!
//! The workspace is split into:
//! - `threat-scanner`: the static analyzer
//! - `sandbox-runtime`: loader, tiers, monitor, access control, orchestrator
//!
//! This crate adds the command-line front end and the stdio protocol used by
//! `strategy-sandbox serve`.

pub mod cli;
pub mod serve;

pub use sandbox_runtime;
pub use threat_scanner;

/// Prelude for embedding the sandbox.
pub mod prelude {
    pub use sandbox_runtime::{
        AccessPolicy, ErrorKind, ExecutionRequest, ExecutionResult, ResourceLimits, Role,
        SandboxConfig, SandboxOrchestrator, ScriptEngine, TierKind,
    };
    pub use threat_scanner::{analyze, Severity, ThreatCategory, ThreatReport};
}
