//! Shared fixtures for the orchestrator tests.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox_runtime::monitor::{ProbeError, ResourceProbe, ResourceSample};
use sandbox_runtime::tier::{LimitResource, ProcessLimits, RlimitGovernor, RlimitTier};
use sandbox_runtime::{
    AccessPolicy, ExecutionError, ExpressionEngine, IsolationTier, RawResult, Role, SandboxConfig,
    SandboxOrchestrator, TierJob, TierKind,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Usage that never changes, so the monitor never sees growth.
pub struct FixedProbe;

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> Result<ResourceSample, ProbeError> {
        Ok(ResourceSample {
            rss_bytes: 64 * 1024 * 1024,
            virtual_bytes: 256 * 1024 * 1024,
            cpu_seconds: 1.0,
            threads: 4,
            open_fds: 12,
            children: 0,
        })
    }
}

/// Leaves the real process limits alone.
pub struct NoopLimits;

impl ProcessLimits for NoopLimits {
    fn soft_limit(&self, _resource: LimitResource) -> io::Result<Option<u64>> {
        Ok(None)
    }

    fn set_soft_limit(&self, _resource: LimitResource, _value: Option<u64>) -> io::Result<()> {
        Ok(())
    }
}

/// The in-process tier over the reference engine, without touching rlimits.
pub fn in_process_tier() -> Arc<dyn IsolationTier> {
    let governor = Arc::new(RlimitGovernor::new(Arc::new(NoopLimits), Arc::new(FixedProbe)));
    Arc::new(RlimitTier::new(Arc::new(ExpressionEngine::new()), governor))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Returns `{"ok": true}` at once.
    Succeed,
    /// Waits for `release` (or the job's cancellation), then succeeds.
    Block,
    /// Never finishes on its own.
    Hang,
    /// Fails as broken machinery.
    MachineryFault,
    /// Fails the way a buggy script does.
    ScriptFault,
}

/// Scriptable tier that records how it was used.
pub struct TestTier {
    behaviour: Behaviour,
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub release: CancellationToken,
}

impl TestTier {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            release: CancellationToken::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IsolationTier for TestTier {
    fn kind(&self) -> TierKind {
        TierKind::Rlimit
    }

    async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let started = Instant::now();

        let outcome = match self.behaviour {
            Behaviour::Succeed => Ok(json!({"ok": true})),
            Behaviour::Block => {
                tokio::select! {
                    _ = self.release.cancelled() => Ok(json!({"ok": true})),
                    _ = job.cancel.cancelled() => Err(ExecutionError::cancelled("stopped by supervisor")),
                }
            }
            Behaviour::Hang => std::future::pending().await,
            Behaviour::MachineryFault => Err(ExecutionError::tier_failure("runtime socket gone")),
            Behaviour::ScriptFault => Err(ExecutionError::script("division by zero")),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome.map(|value| RawResult {
            value,
            elapsed: started.elapsed(),
        })
    }
}

pub const DOUBLER: &str = "def double(x):\n    return x * 2\n";
pub const ECHO: &str = "def echo(value):\n    return value\n";

/// Storage root with `alice/double.py` and `alice/echo.py`, and a config
/// granting `alice` the trader role.
pub fn fixture() -> (TempDir, SandboxConfig) {
    let root = tempfile::tempdir().unwrap();
    write_script(root.path(), "alice/double.py", DOUBLER);
    write_script(root.path(), "alice/echo.py", ECHO);
    write_script(root.path(), "bob/private.py", DOUBLER);

    let mut config = SandboxConfig::default();
    config.storage_root = root.path().to_path_buf();
    config.monitor.sample_interval_ms = 20;
    config.access.policies = vec![
        AccessPolicy::new("alice", Role::Trader),
        AccessPolicy::new("victor", Role::Viewer),
    ];
    (root, config)
}

pub fn write_script(root: &Path, reference: &str, code: &str) {
    let path = root.join(reference);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, code).unwrap();
}

pub async fn orchestrator(config: SandboxConfig, tier: Arc<dyn IsolationTier>) -> SandboxOrchestrator {
    SandboxOrchestrator::builder(config)
        .probe(Arc::new(FixedProbe))
        .tier(tier)
        .build()
        .await
        .unwrap()
}

/// Polls `condition` every few milliseconds for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
