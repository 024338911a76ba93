//! Isolation tiers and the startup-time selector.
//!
//! Capabilities are probed once; the strongest available tier (or the one
//! forced by configuration) is fixed for the life of the process. Every tier
//! takes a [`TierJob`] and returns the same [`RawResult`] / [`ExecutionError`]
//! shape.

mod cgroup;
mod container;
mod rlimit;

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::engine::{ExecutionContext, ScriptEngine};
use crate::error::ExecutionError;
use crate::limits::ResourceLimits;
use crate::monitor::{ResourceProbe, SampleScope, WorkerScope};
use crate::request::ExecutionId;

pub use cgroup::CgroupTier;
pub use container::ContainerTier;
pub use rlimit::{
    GovernorLease, LimitResource, ProcessLimits, RlimitGovernor, RlimitTier, SystemProcessLimits,
};

/// Worker threads get at least this much stack so compiling stays within
/// it; a smaller `stack_mb` still shrinks the evaluation depth budget.
const MIN_WORKER_STACK: u64 = 4 * 1024 * 1024;

/// Isolation strategies, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Container,
    Cgroup,
    Rlimit,
}

impl TierKind {
    pub const STRONGEST_FIRST: [TierKind; 3] = [TierKind::Container, TierKind::Cgroup, TierKind::Rlimit];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Container => "container",
            TierKind::Cgroup => "cgroup",
            TierKind::Rlimit => "rlimit",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the host supports, probed once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierCapabilities {
    pub container: bool,
    pub cgroup: bool,
    /// In-process limits need nothing from the host.
    pub rlimit: bool,
}

impl TierCapabilities {
    pub async fn probe(config: &SandboxConfig) -> Self {
        let container = ContainerTier::probe(&config.container).await;
        let cgroup = CgroupTier::probe(&config.cgroup.root);
        let capabilities = Self {
            container,
            cgroup,
            rlimit: true,
        };
        info!(
            "🔍 Isolation capabilities: container={} cgroup={} rlimit={}",
            capabilities.container, capabilities.cgroup, capabilities.rlimit
        );
        capabilities
    }

    pub fn only_rlimit() -> Self {
        Self {
            container: false,
            cgroup: false,
            rlimit: true,
        }
    }

    pub fn available(&self, kind: TierKind) -> bool {
        match kind {
            TierKind::Container => self.container,
            TierKind::Cgroup => self.cgroup,
            TierKind::Rlimit => self.rlimit,
        }
    }
}

/// The forced tier if available, otherwise the strongest available one.
pub fn select_tier(
    preference: Option<TierKind>,
    capabilities: &TierCapabilities,
) -> Result<TierKind, ExecutionError> {
    match preference {
        Some(kind) if capabilities.available(kind) => Ok(kind),
        Some(kind) => Err(ExecutionError::TierUnavailable {
            tier: kind.as_str().to_string(),
        }),
        None => TierKind::STRONGEST_FIRST
            .into_iter()
            .find(|kind| capabilities.available(*kind))
            .ok_or_else(|| ExecutionError::TierUnavailable {
                tier: "any".to_string(),
            }),
    }
}

/// Everything a tier needs to run one execution. `code` is the exact text
/// that was scanned. Tiers that run the work in this process record where in
/// `scope` so the monitor charges the execution for that alone.
#[derive(Debug, Clone)]
pub struct TierJob {
    pub execution_id: ExecutionId,
    pub script_name: String,
    pub code: Arc<str>,
    pub entry_point: String,
    pub params: BTreeMap<String, Value>,
    pub limits: ResourceLimits,
    pub scope: Arc<WorkerScope>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub value: Value,
    pub elapsed: Duration,
}

#[async_trait]
pub trait IsolationTier: Send + Sync {
    fn kind(&self) -> TierKind;

    async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError>;
}

/// Holds the tier chosen at startup and dispatches to it.
#[derive(Clone)]
pub struct TierSelector {
    capabilities: TierCapabilities,
    tier: Arc<dyn IsolationTier>,
}

impl TierSelector {
    /// Probes the host and builds the selected tier.
    pub async fn probe(
        config: &SandboxConfig,
        engine: Arc<dyn ScriptEngine>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, ExecutionError> {
        let capabilities = TierCapabilities::probe(config).await;
        let kind = select_tier(config.preferred_tier, &capabilities)?;
        let tier: Arc<dyn IsolationTier> = match kind {
            TierKind::Container => Arc::new(ContainerTier::new(config.container.clone())),
            TierKind::Cgroup => Arc::new(CgroupTier::new(config.cgroup.root.clone(), engine, probe)),
            TierKind::Rlimit => Arc::new(RlimitTier::new(
                engine,
                Arc::new(RlimitGovernor::new(Arc::new(SystemProcessLimits), probe)),
            )),
        };
        info!("🧱 Isolation tier selected: {}", kind);
        Ok(Self { capabilities, tier })
    }

    /// Uses `tier` as is, without probing.
    pub fn with_tier(tier: Arc<dyn IsolationTier>) -> Self {
        let kind = tier.kind();
        Self {
            capabilities: TierCapabilities {
                container: kind == TierKind::Container,
                cgroup: kind == TierKind::Cgroup,
                rlimit: true,
            },
            tier,
        }
    }

    pub fn kind(&self) -> TierKind {
        self.tier.kind()
    }

    pub fn capabilities(&self) -> &TierCapabilities {
        &self.capabilities
    }

    pub async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError> {
        self.tier.execute(job).await
    }
}

impl fmt::Debug for TierSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierSelector")
            .field("kind", &self.kind())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Compiles and invokes the job on a dedicated thread with `stack_mb` of
/// stack, under the job's allocation and nesting budgets. Used by the
/// in-process tiers.
pub(crate) async fn run_in_process(
    engine: Arc<dyn ScriptEngine>,
    job: TierJob,
) -> Result<RawResult, ExecutionError> {
    let (tx, rx) = oneshot::channel();
    let stack_bytes = usize::try_from(job.limits.stack_bytes().max(MIN_WORKER_STACK)).unwrap_or(usize::MAX);
    let thread_name = format!("sandbox-{}", job.execution_id);

    std::thread::Builder::new()
        .name(thread_name)
        .stack_size(stack_bytes)
        .spawn(move || {
            job.scope.assign(SampleScope::current_thread());
            let started = Instant::now();
            let ctx = ExecutionContext::new(job.execution_id, job.cancel.clone()).with_limits(job.limits);
            let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Value, ExecutionError> {
                let unit = engine.compile(&job.code)?;
                Ok(engine.invoke(&unit, &job.entry_point, &job.params, &ctx)?)
            }))
            .unwrap_or_else(|_| Err(ExecutionError::script("script engine panicked")));
            // The receiver is gone if the orchestrator already gave up.
            let _ = tx.send(outcome.map(|value| RawResult {
                value,
                elapsed: started.elapsed(),
            }));
        })
        .map_err(|e| {
            warn!("Failed to spawn sandbox worker thread: {}", e);
            ExecutionError::tier_failure("could not start worker thread")
        })?;

    rx.await
        .map_err(|_| ExecutionError::tier_failure("worker thread exited without a result"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExpressionEngine;
    use serde_json::json;

    #[test]
    fn selects_strongest_available() {
        let all = TierCapabilities {
            container: true,
            cgroup: true,
            rlimit: true,
        };
        assert_eq!(select_tier(None, &all).unwrap(), TierKind::Container);
        let no_container = TierCapabilities {
            container: false,
            ..all.clone()
        };
        assert_eq!(select_tier(None, &no_container).unwrap(), TierKind::Cgroup);
        assert_eq!(
            select_tier(None, &TierCapabilities::only_rlimit()).unwrap(),
            TierKind::Rlimit
        );
    }

    #[test]
    fn forced_tier_must_be_available() {
        let caps = TierCapabilities::only_rlimit();
        assert_eq!(select_tier(Some(TierKind::Rlimit), &caps).unwrap(), TierKind::Rlimit);
        assert_eq!(
            select_tier(Some(TierKind::Container), &caps).unwrap_err(),
            ExecutionError::TierUnavailable {
                tier: "container".into()
            }
        );
    }

    #[test]
    fn tier_kind_serde_is_lowercase() {
        assert_eq!(serde_json::to_value(TierKind::Cgroup).unwrap(), json!("cgroup"));
        let kind: TierKind = serde_json::from_value(json!("rlimit")).unwrap();
        assert_eq!(kind, TierKind::Rlimit);
    }

    fn job(code: &str) -> TierJob {
        TierJob {
            execution_id: ExecutionId::new(),
            script_name: "alice/test.py".into(),
            code: Arc::from(code),
            entry_point: "f".into(),
            params: BTreeMap::from([("x".to_string(), json!(21))]),
            limits: ResourceLimits::default(),
            scope: Arc::new(WorkerScope::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn runs_in_process_on_worker_thread() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(ExpressionEngine::new());
        let raw = run_in_process(engine, job("def f(x):\n    return x * 2\n"))
            .await
            .unwrap();
        assert_eq!(raw.value, json!(42));
    }

    #[tokio::test]
    async fn compile_errors_keep_their_line() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(ExpressionEngine::new());
        let err = run_in_process(engine, job("def f(x):\n    while x:\n        pass\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Compile { line: Some(2), .. }));
    }

    #[tokio::test]
    async fn worker_thread_is_recorded_as_the_scope() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(ExpressionEngine::new());
        let job = job("def f(x):\n    return x\n");
        let scope = Arc::clone(&job.scope);
        run_in_process(engine, job).await.unwrap();
        let recorded = scope.current().unwrap();
        if cfg!(target_os = "linux") {
            assert!(matches!(recorded, SampleScope::Thread(_)));
            assert_ne!(recorded, SampleScope::current_thread());
        }
    }

    #[tokio::test]
    async fn script_allocation_past_memory_limit_is_a_resource_error() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(ExpressionEngine::new());
        let mut job = job("def f(x):\n    a = [x] * 999999\n    b = a + a\n    return len(b + b)\n");
        job.limits.memory_mb = 16;
        let err = run_in_process(engine, job).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExceeded { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn deeply_nested_script_fails_to_compile_on_the_worker() {
        let engine: Arc<dyn ScriptEngine> = Arc::new(ExpressionEngine::new());
        let code = format!("def f(x):\n    return {}x{}\n", "(".repeat(20_000), ")".repeat(20_000));
        let err = run_in_process(engine, job(&code)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Compile { .. }), "{err:?}");
    }
}
