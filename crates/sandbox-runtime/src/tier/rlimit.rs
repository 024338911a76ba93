//! In-process limit tier: soft rlimits plus a sized worker thread.
//!
//! rlimits are process-wide, so concurrent executions share one governor.
//! On every entry and exit the governor measures current usage and sets each
//! soft limit to that usage plus the headroom of every active execution. The
//! originals are restored once the last one leaves. Hard limits are never
//! touched, so the process can always raise its limits back.
//!
//! The limits are a backstop for the whole process. Per-execution budgets are
//! enforced by the engine and the monitor, well before these trip:
//!
//! - address space headroom is several times the engine's allocation budget
//!   plus the worker stack, with a fixed allowance for runtime threads;
//! - CPU headroom is what every core could burn over the execution's wall
//!   clock window, so SIGXCPU cannot reach a process whose executions end on
//!   time.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{run_in_process, IsolationTier, RawResult, TierJob, TierKind};
use crate::engine::ScriptEngine;
use crate::error::ExecutionError;
use crate::limits::ResourceLimits;
use crate::monitor::ResourceProbe;

const GIB: u64 = 1024 * 1024 * 1024;
/// Address space multiple of `memory_mb` granted per execution.
const ADDRESS_SPACE_FACTOR: u64 = 4;
/// Allocator arenas and runtime threads reserve address space freely.
const ADDRESS_SPACE_ALLOWANCE: u64 = GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitResource {
    AddressSpace,
    CpuTime,
    OpenFiles,
}

impl LimitResource {
    const ALL: [LimitResource; 3] = [
        LimitResource::AddressSpace,
        LimitResource::CpuTime,
        LimitResource::OpenFiles,
    ];
}

/// Soft-limit access. `None` means unlimited.
pub trait ProcessLimits: Send + Sync {
    fn soft_limit(&self, resource: LimitResource) -> io::Result<Option<u64>>;

    /// Sets the soft limit, clamped to the hard limit.
    fn set_soft_limit(&self, resource: LimitResource, value: Option<u64>) -> io::Result<()>;
}

/// `getrlimit`/`setrlimit` on the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessLimits;

#[cfg(target_os = "linux")]
impl ProcessLimits for SystemProcessLimits {
    fn soft_limit(&self, resource: LimitResource) -> io::Result<Option<u64>> {
        let current = get_rlimit(resource)?;
        Ok((current.rlim_cur != libc::RLIM_INFINITY).then_some(current.rlim_cur))
    }

    fn set_soft_limit(&self, resource: LimitResource, value: Option<u64>) -> io::Result<()> {
        let current = get_rlimit(resource)?;
        let soft = value.unwrap_or(libc::RLIM_INFINITY).min(current.rlim_max);
        let lim = libc::rlimit {
            rlim_cur: soft,
            rlim_max: current.rlim_max,
        };
        // SAFETY: `lim` is a valid rlimit for the duration of the call.
        let rc = unsafe {
            match resource {
                LimitResource::AddressSpace => libc::setrlimit(libc::RLIMIT_AS, &lim),
                LimitResource::CpuTime => libc::setrlimit(libc::RLIMIT_CPU, &lim),
                LimitResource::OpenFiles => libc::setrlimit(libc::RLIMIT_NOFILE, &lim),
            }
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(target_os = "linux")]
fn get_rlimit(resource: LimitResource) -> io::Result<libc::rlimit> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `lim` is a valid out-pointer for the duration of the call.
    let rc = unsafe {
        match resource {
            LimitResource::AddressSpace => libc::getrlimit(libc::RLIMIT_AS, &mut lim),
            LimitResource::CpuTime => libc::getrlimit(libc::RLIMIT_CPU, &mut lim),
            LimitResource::OpenFiles => libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim),
        }
    };
    if rc == 0 {
        Ok(lim)
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessLimits for SystemProcessLimits {
    fn soft_limit(&self, _resource: LimitResource) -> io::Result<Option<u64>> {
        Ok(None)
    }

    fn set_soft_limit(&self, _resource: LimitResource, _value: Option<u64>) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    active: usize,
    /// Headroom of every active execution: address space bytes, cpu
    /// seconds, open files.
    budget: [u64; 3],
    original: Option<[Option<u64>; 3]>,
}

/// Reference-counted owner of the process soft limits.
pub struct RlimitGovernor {
    limits: Arc<dyn ProcessLimits>,
    probe: Arc<dyn ResourceProbe>,
    cores: u64,
    state: Mutex<GovernorState>,
}

impl RlimitGovernor {
    pub fn new(limits: Arc<dyn ProcessLimits>, probe: Arc<dyn ResourceProbe>) -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get() as u64);
        Self {
            limits,
            probe,
            cores,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Soft-limit headroom one execution adds.
    fn headroom(&self, limits: &ResourceLimits) -> [u64; 3] {
        let window = limits.wall_seconds.max(limits.cpu_seconds);
        [
            limits
                .memory_bytes()
                .saturating_mul(ADDRESS_SPACE_FACTOR)
                .saturating_add(limits.stack_bytes()),
            window.saturating_mul(self.cores),
            limits.max_open_files,
        ]
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Adds `limits` to the active budget and applies the new soft limits.
    pub fn enter(self: &Arc<Self>, limits: ResourceLimits) -> Result<GovernorLease, ExecutionError> {
        let budget = self.headroom(&limits);
        let mut state = self.state.lock();

        if state.active == 0 {
            let mut original = [None; 3];
            for (slot, resource) in original.iter_mut().zip(LimitResource::ALL) {
                *slot = self.limits.soft_limit(resource).map_err(|e| {
                    warn!("getrlimit({:?}) failed: {}", resource, e);
                    ExecutionError::tier_failure("cannot read process limits")
                })?;
            }
            state.original = Some(original);
        }

        for (total, add) in state.budget.iter_mut().zip(budget) {
            *total = total.saturating_add(add);
        }
        state.active += 1;

        if let Err(e) = self.apply(&state) {
            self.release(&mut state, budget);
            return Err(e);
        }
        Ok(GovernorLease {
            governor: Arc::clone(self),
            budget,
        })
    }

    /// Measures usage now and sets each soft limit to usage plus headroom.
    fn apply(&self, state: &GovernorState) -> Result<(), ExecutionError> {
        let sample = self.probe.sample().map_err(|e| {
            warn!("Cannot measure usage for rlimits: {}", e);
            ExecutionError::tier_failure("resource usage unavailable")
        })?;
        let usage = [
            sample.virtual_bytes.saturating_add(ADDRESS_SPACE_ALLOWANCE),
            sample.cpu_seconds.ceil() as u64,
            sample.open_fds,
        ];
        for (idx, resource) in LimitResource::ALL.into_iter().enumerate() {
            let target = usage[idx].saturating_add(state.budget[idx]);
            self.limits
                .set_soft_limit(resource, Some(target))
                .map_err(|e| {
                    warn!("setrlimit({:?}) failed: {}", resource, e);
                    ExecutionError::tier_failure("cannot apply process limits")
                })?;
        }
        debug!(active = state.active, usage = ?usage, budget = ?state.budget, "process soft limits applied");
        Ok(())
    }

    fn release(&self, state: &mut GovernorState, budget: [u64; 3]) {
        for (total, sub) in state.budget.iter_mut().zip(budget) {
            *total = total.saturating_sub(sub);
        }
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            if let Some(original) = state.original.take() {
                for (resource, value) in LimitResource::ALL.into_iter().zip(original) {
                    if let Err(e) = self.limits.set_soft_limit(resource, value) {
                        warn!("Failed to restore {:?} limit: {}", resource, e);
                    }
                }
            }
            state.budget = [0; 3];
            debug!("process soft limits restored");
        } else if let Err(e) = self.apply(state) {
            warn!("Failed to re-apply process limits: {}", e);
        }
    }
}

/// Releases its budget on drop.
pub struct GovernorLease {
    governor: Arc<RlimitGovernor>,
    budget: [u64; 3],
}

impl Drop for GovernorLease {
    fn drop(&mut self) {
        let mut state = self.governor.state.lock();
        self.governor.release(&mut state, self.budget);
    }
}

pub struct RlimitTier {
    engine: Arc<dyn ScriptEngine>,
    governor: Arc<RlimitGovernor>,
}

impl RlimitTier {
    pub fn new(engine: Arc<dyn ScriptEngine>, governor: Arc<RlimitGovernor>) -> Self {
        Self { engine, governor }
    }
}

#[async_trait]
impl IsolationTier for RlimitTier {
    fn kind(&self) -> TierKind {
        TierKind::Rlimit
    }

    async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError> {
        let _lease = self.governor.enter(job.limits)?;
        run_in_process(Arc::clone(&self.engine), job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ProbeError, ResourceSample, WorkerScope};
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingLimits {
        soft: Mutex<HashMap<LimitResource, Option<u64>>>,
    }

    impl ProcessLimits for RecordingLimits {
        fn soft_limit(&self, resource: LimitResource) -> io::Result<Option<u64>> {
            Ok(self.soft.lock().get(&resource).copied().flatten())
        }

        fn set_soft_limit(&self, resource: LimitResource, value: Option<u64>) -> io::Result<()> {
            self.soft.lock().insert(resource, value);
            Ok(())
        }
    }

    struct FixedProbe;

    impl ResourceProbe for FixedProbe {
        fn sample(&self) -> Result<ResourceSample, ProbeError> {
            Ok(ResourceSample {
                virtual_bytes: 1000,
                cpu_seconds: 1.2,
                open_fds: 10,
                ..ResourceSample::default()
            })
        }
    }

    /// Process CPU time the test advances by hand.
    #[derive(Default)]
    struct BusyProbe {
        cpu_seconds: Mutex<f64>,
    }

    impl BusyProbe {
        fn burn(&self, seconds: f64) {
            *self.cpu_seconds.lock() += seconds;
        }

        fn cpu(&self) -> f64 {
            *self.cpu_seconds.lock()
        }
    }

    impl ResourceProbe for BusyProbe {
        fn sample(&self) -> Result<ResourceSample, ProbeError> {
            Ok(ResourceSample {
                cpu_seconds: self.cpu(),
                ..ResourceSample::default()
            })
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn budgets_stack_and_restore() {
        let limits = Arc::new(RecordingLimits::default());
        let governor = Arc::new(RlimitGovernor::new(limits.clone(), Arc::new(FixedProbe)));
        let small = ResourceLimits {
            memory_mb: 10,
            cpu_seconds: 2,
            max_open_files: 5,
            ..ResourceLimits::default()
        };

        let first = governor.enter(small).unwrap();
        assert_eq!(
            limits.soft_limit(LimitResource::AddressSpace).unwrap(),
            Some(1000 + ADDRESS_SPACE_ALLOWANCE + 4 * 10 * MIB + 8 * MIB)
        );
        assert_eq!(
            limits.soft_limit(LimitResource::CpuTime).unwrap(),
            Some(2 + small.wall_seconds * governor.cores)
        );

        let second = governor.enter(small).unwrap();
        assert_eq!(governor.active(), 2);
        assert_eq!(limits.soft_limit(LimitResource::OpenFiles).unwrap(), Some(10 + 10));

        drop(first);
        assert_eq!(limits.soft_limit(LimitResource::OpenFiles).unwrap(), Some(15));
        drop(second);
        assert_eq!(governor.active(), 0);
        assert_eq!(limits.soft_limit(LimitResource::OpenFiles).unwrap(), None);
    }

    #[test]
    fn existing_soft_limit_is_restored_after_last_exit() {
        let limits = Arc::new(RecordingLimits::default());
        limits.set_soft_limit(LimitResource::OpenFiles, Some(12)).unwrap();
        let governor = Arc::new(RlimitGovernor::new(limits.clone(), Arc::new(FixedProbe)));
        let lease = governor.enter(ResourceLimits::default()).unwrap();
        assert_eq!(limits.soft_limit(LimitResource::OpenFiles).unwrap(), Some(10 + 64));
        drop(lease);
        assert_eq!(limits.soft_limit(LimitResource::OpenFiles).unwrap(), Some(12));
    }

    #[test]
    fn cpu_limit_stays_ahead_of_usage_under_overlapping_load() {
        let limits = Arc::new(RecordingLimits::default());
        let probe = Arc::new(BusyProbe::default());
        let governor = Arc::new(RlimitGovernor::new(limits.clone(), probe.clone()));
        let budget = ResourceLimits {
            cpu_seconds: 5,
            wall_seconds: 5,
            ..ResourceLimits::default()
        };
        let soft_cpu = || limits.soft_limit(LimitResource::CpuTime).unwrap().unwrap() as f64;

        let mut leases: std::collections::VecDeque<_> =
            (0..4).map(|_| governor.enter(budget).unwrap()).collect();
        for _ in 0..20 {
            // Every active execution spends most of its CPU budget.
            probe.burn(4.5 * leases.len() as f64);
            assert!(soft_cpu() > probe.cpu(), "limit {} behind usage {}", soft_cpu(), probe.cpu());

            drop(leases.pop_front());
            assert!(soft_cpu() > probe.cpu());
            leases.push_back(governor.enter(budget).unwrap());
            assert!(soft_cpu() > probe.cpu());
            assert_eq!(governor.active(), 4);
        }

        drop(leases);
        assert_eq!(governor.active(), 0);
        assert_eq!(limits.soft_limit(LimitResource::CpuTime).unwrap(), None);
    }

    #[tokio::test]
    async fn tier_runs_engine_under_lease() {
        use crate::engine::ExpressionEngine;
        use crate::request::ExecutionId;
        use serde_json::json;
        use std::collections::BTreeMap;
        use tokio_util::sync::CancellationToken;

        let limits = Arc::new(RecordingLimits::default());
        let governor = Arc::new(RlimitGovernor::new(limits, Arc::new(FixedProbe)));
        let tier = RlimitTier::new(Arc::new(ExpressionEngine::new()), governor.clone());
        let raw = tier
            .execute(TierJob {
                execution_id: ExecutionId::new(),
                script_name: "alice/a.py".into(),
                code: Arc::from("def f(x):\n    return x + 1\n"),
                entry_point: "f".into(),
                params: BTreeMap::from([("x".to_string(), json!(1))]),
                limits: ResourceLimits::default(),
                scope: Arc::new(WorkerScope::new()),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(raw.value, json!(2));
        assert_eq!(governor.active(), 0);
    }
}
