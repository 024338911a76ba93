//! Per-execution resource supervision.
//!
//! [`ResourceMonitor::attach`] spawns a tokio task that samples the
//! execution's [`WorkerScope`] through a [`ResourceProbe`], compares usage
//! against the execution's limits relative to the first sample of that
//! scope, and cancels the execution's token on the first breach. Nothing is
//! sampled until the tier assigns a scope. Losing supervision (the probe's
//! breaker opening) is itself a breach: the monitor fails closed.

pub mod baseline;
mod breaker;
mod crash;
mod probe;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Level};

use crate::config::{BreakerConfig, MonitorConfig};
use crate::error::{ErrorKind, ExecutionError, SandboxError};
use crate::limits::ResourceLimits;
use crate::request::ExecutionId;

pub use baseline::SystemBaseline;
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use crash::{install_signal_handlers, EmergencyStop, SignalInstall};
pub use probe::{ProbeError, ProcFsProbe, ResourceProbe, ResourceSample, SampleScope, WorkerScope};

const MIB: u64 = 1024 * 1024;

/// Why the monitor stopped an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    Memory { used_bytes: u64, limit_bytes: u64 },
    Cpu { used_seconds: f64, limit_seconds: u64 },
    Threads { used: u64, limit: u64 },
    OpenFiles { used: u64, limit: u64 },
    ChildProcesses { used: u64, limit: u64 },
    EmergencyStop { reason: String },
    SupervisionLost,
}

impl Breach {
    /// Short label used in metrics and events.
    pub fn label(&self) -> &'static str {
        match self {
            Breach::Memory { .. } => "memory",
            Breach::Cpu { .. } => "cpu",
            Breach::Threads { .. } => "threads",
            Breach::OpenFiles { .. } => "open_files",
            Breach::ChildProcesses { .. } => "child_processes",
            Breach::EmergencyStop { .. } => "emergency_stop",
            Breach::SupervisionLost => "supervision_lost",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.clone().into_error().kind()
    }

    pub fn into_error(self) -> SandboxError {
        match self {
            Breach::Memory {
                used_bytes,
                limit_bytes,
            } => ExecutionError::resource(format!(
                "memory grew by {} MiB, limit {} MiB",
                used_bytes / MIB,
                limit_bytes / MIB
            ))
            .into(),
            Breach::Cpu {
                used_seconds,
                limit_seconds,
            } => ExecutionError::resource(format!(
                "cpu time {used_seconds:.2}s, limit {limit_seconds}s"
            ))
            .into(),
            Breach::Threads { used, limit } => {
                ExecutionError::resource(format!("threads grew by {used}, limit {limit}")).into()
            }
            Breach::OpenFiles { used, limit } => {
                ExecutionError::resource(format!("open files grew by {used}, limit {limit}")).into()
            }
            Breach::ChildProcesses { used, limit } => {
                ExecutionError::resource(format!("child processes grew by {used}, limit {limit}")).into()
            }
            Breach::EmergencyStop { reason } => {
                ExecutionError::cancelled(format!("emergency stop: {reason}")).into()
            }
            Breach::SupervisionLost => SandboxError::internal("resource supervision lost"),
        }
    }
}

/// First limit `sample` exceeds relative to `reference`, if any.
pub fn check_limits(reference: &ResourceSample, sample: &ResourceSample, limits: &ResourceLimits) -> Option<Breach> {
    let memory = sample.rss_bytes.saturating_sub(reference.rss_bytes);
    if memory > limits.memory_bytes() {
        return Some(Breach::Memory {
            used_bytes: memory,
            limit_bytes: limits.memory_bytes(),
        });
    }
    let cpu = (sample.cpu_seconds - reference.cpu_seconds).max(0.0);
    if cpu > limits.cpu_seconds as f64 {
        return Some(Breach::Cpu {
            used_seconds: cpu,
            limit_seconds: limits.cpu_seconds,
        });
    }
    let threads = sample.threads.saturating_sub(reference.threads);
    if threads > limits.max_threads {
        return Some(Breach::Threads {
            used: threads,
            limit: limits.max_threads,
        });
    }
    let files = sample.open_fds.saturating_sub(reference.open_fds);
    if files > limits.max_open_files {
        return Some(Breach::OpenFiles {
            used: files,
            limit: limits.max_open_files,
        });
    }
    let children = sample.children.saturating_sub(reference.children);
    if children > limits.max_child_processes {
        return Some(Breach::ChildProcesses {
            used: children,
            limit: limits.max_child_processes,
        });
    }
    None
}

/// Spawns one supervision task per execution.
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    config: MonitorConfig,
    breaker: Arc<CircuitBreaker>,
    emergency: Arc<EmergencyStop>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        config: MonitorConfig,
        breaker_config: &BreakerConfig,
        emergency: Arc<EmergencyStop>,
    ) -> Self {
        Self {
            probe,
            config,
            breaker: Arc::new(CircuitBreaker::new("monitor", breaker_config)),
            emergency,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn probe(&self) -> &Arc<dyn ResourceProbe> {
        &self.probe
    }

    /// Starts supervising whatever `scope` comes to hold. A breach cancels
    /// `cancel`; the handle reports it.
    pub fn attach(
        &self,
        execution_id: ExecutionId,
        limits: ResourceLimits,
        scope: Arc<WorkerScope>,
        cancel: CancellationToken,
    ) -> MonitorHandle {
        let breach = Arc::new(Mutex::new(None));
        let stop = CancellationToken::new();
        let supervisor = Supervisor {
            execution_id,
            limits,
            scope,
            probe: Arc::clone(&self.probe),
            config: self.config.clone(),
            breaker: Arc::clone(&self.breaker),
            emergency: Arc::clone(&self.emergency),
            cancel,
            breach: Arc::clone(&breach),
        };
        let task = tokio::spawn(supervisor.run(stop.clone()));
        MonitorHandle {
            breach,
            stop,
            task: Some(task),
        }
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

/// Owned by the orchestrator for the life of one execution. Dropping it
/// stops the supervision task.
#[derive(Debug)]
pub struct MonitorHandle {
    breach: Arc<Mutex<Option<Breach>>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn breach(&self) -> Option<Breach> {
        self.breach.lock().clone()
    }

    /// Stops the task, waits for it, and returns the recorded breach.
    pub async fn stop(mut self) -> Option<Breach> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
        self.breach()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Supervisor {
    execution_id: ExecutionId,
    limits: ResourceLimits,
    scope: Arc<WorkerScope>,
    probe: Arc<dyn ResourceProbe>,
    config: MonitorConfig,
    breaker: Arc<CircuitBreaker>,
    emergency: Arc<EmergencyStop>,
    cancel: CancellationToken,
    breach: Arc<Mutex<Option<Breach>>>,
}

impl Supervisor {
    async fn run(self, stop: CancellationToken) {
        let mut emergency = self.emergency.subscribe();
        if self.emergency.is_active() {
            self.record(Breach::EmergencyStop {
                reason: self.emergency.reason().unwrap_or_default(),
            });
            return;
        }

        let mut reference: Option<ResourceSample> = None;
        let started = Instant::now();
        let growth_limit = (self.limits.memory_bytes() as f64 * self.config.growth_warning_fraction) as u64;
        let mut history: VecDeque<(Instant, u64)> = VecDeque::new();
        let mut growth_warned = false;

        let mut ticker = interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = self.cancel.cancelled() => return,
                changed = emergency.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *emergency.borrow_and_update() {
                        self.record(Breach::EmergencyStop {
                            reason: self.emergency.reason().unwrap_or_default(),
                        });
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let Some(scope) = self.scope.current() else {
                        continue;
                    };
                    if !self.breaker.allow_request() {
                        self.record(Breach::SupervisionLost);
                        return;
                    }
                    let sample = match self.probe.sample_scope(scope) {
                        Ok(sample) => {
                            self.breaker.record_success();
                            sample
                        }
                        Err(e) => {
                            warn!(execution_id = %self.execution_id, "Resource probe failed: {}", e);
                            self.breaker.record_failure();
                            if self.breaker.state() == BreakerState::Open {
                                self.record(Breach::SupervisionLost);
                                return;
                            }
                            continue;
                        }
                    };

                    let Some(reference) = reference else {
                        debug!(execution_id = %self.execution_id, ?scope, "reference sample taken");
                        reference = Some(sample);
                        continue;
                    };
                    if let Some(breach) = check_limits(&reference, &sample, &self.limits) {
                        self.record(breach);
                        return;
                    }

                    let now = Instant::now();
                    history.push_back((now, sample.rss_bytes));
                    while history
                        .front()
                        .is_some_and(|(at, _)| now.duration_since(*at) > self.config.growth_window())
                    {
                        history.pop_front();
                    }
                    if let Some((_, oldest)) = history.front() {
                        let growth = sample.rss_bytes.saturating_sub(*oldest);
                        if !growth_warned && growth > growth_limit {
                            growth_warned = true;
                            warn!(
                                execution_id = %self.execution_id,
                                growth_mib = growth / MIB,
                                window_secs = self.config.growth_window_secs,
                                "Memory growing quickly"
                            );
                        }
                    }

                    if let Some(baseline) = baseline::baseline().filter(|_| tracing::enabled!(Level::DEBUG)) {
                        let process = match scope {
                            SampleScope::Process => Ok(sample),
                            SampleScope::Thread(_) => self.probe.sample(),
                        };
                        if let Ok(process) = process {
                            debug!(
                                execution_id = %self.execution_id,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                rss_drift_kib = (process.rss_bytes as i64 - baseline.rss_bytes as i64) / 1024,
                                thread_drift = process.threads as i64 - baseline.threads as i64,
                                "drift above startup baseline"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Keeps the first breach only, then cancels the execution.
    fn record(&self, breach: Breach) {
        let mut slot = self.breach.lock();
        if slot.is_none() {
            warn!(
                execution_id = %self.execution_id,
                breach = breach.label(),
                "Execution breached its limits"
            );
            *slot = Some(breach);
        }
        drop(slot);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// RSS grows by `step` bytes on every sample.
    struct GrowingProbe {
        step: u64,
        calls: AtomicU64,
    }

    impl ResourceProbe for GrowingProbe {
        fn sample(&self) -> Result<ResourceSample, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResourceSample {
                rss_bytes: 100 * MIB + n * self.step,
                threads: 4,
                ..ResourceSample::default()
            })
        }
    }

    /// Charges only the scope it is asked about: the process carries
    /// another execution's threads, each worker thread is idle.
    struct SharedProcessProbe;

    impl ResourceProbe for SharedProcessProbe {
        fn sample(&self) -> Result<ResourceSample, ProbeError> {
            unreachable!("monitor samples scopes")
        }

        fn sample_scope(&self, scope: SampleScope) -> Result<ResourceSample, ProbeError> {
            Ok(match scope {
                SampleScope::Process => ResourceSample {
                    threads: 40,
                    children: 9,
                    ..ResourceSample::default()
                },
                SampleScope::Thread(_) => ResourceSample {
                    threads: 1,
                    cpu_seconds: 0.01,
                    ..ResourceSample::default()
                },
            })
        }
    }

    /// Succeeds once (the reference), then fails.
    struct FlakyProbe {
        calls: AtomicU64,
    }

    impl ResourceProbe for FlakyProbe {
        fn sample(&self) -> Result<ResourceSample, ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ResourceSample::default())
            } else {
                Err(ProbeError::Unavailable {
                    message: "gone".into(),
                })
            }
        }
    }

    fn monitor(probe: Arc<dyn ResourceProbe>, emergency: Arc<EmergencyStop>) -> ResourceMonitor {
        ResourceMonitor::new(
            probe,
            MonitorConfig {
                sample_interval_ms: 5,
                ..MonitorConfig::default()
            },
            &BreakerConfig::default(),
            emergency,
        )
    }

    fn process_scope() -> Arc<WorkerScope> {
        Arc::new(WorkerScope::assigned(SampleScope::Process))
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            memory_mb: 16,
            ..ResourceLimits::default()
        }
    }

    #[test]
    fn checks_each_limit_relative_to_reference() {
        let reference = ResourceSample {
            rss_bytes: 50 * MIB,
            cpu_seconds: 10.0,
            threads: 4,
            open_fds: 10,
            ..ResourceSample::default()
        };
        let limits = limits();
        let within = ResourceSample {
            rss_bytes: 60 * MIB,
            cpu_seconds: 12.0,
            ..reference
        };
        assert_eq!(check_limits(&reference, &within, &limits), None);

        let fat = ResourceSample {
            rss_bytes: 70 * MIB,
            ..reference
        };
        assert!(matches!(check_limits(&reference, &fat, &limits), Some(Breach::Memory { .. })));

        let busy = ResourceSample {
            cpu_seconds: 16.0,
            ..reference
        };
        assert!(matches!(check_limits(&reference, &busy, &limits), Some(Breach::Cpu { .. })));

        let forky = ResourceSample {
            children: 2,
            ..reference
        };
        assert!(matches!(
            check_limits(&reference, &forky, &limits),
            Some(Breach::ChildProcesses { used: 2, limit: 1 })
        ));
    }

    #[test]
    fn breaches_map_to_error_kinds() {
        assert_eq!(Breach::SupervisionLost.kind(), ErrorKind::InternalError);
        assert_eq!(
            Breach::Threads { used: 9, limit: 4 }.kind(),
            ErrorKind::ResourceExceeded
        );
        assert_eq!(
            Breach::EmergencyStop { reason: "x".into() }.kind(),
            ErrorKind::InternalError
        );
        assert!(Breach::SupervisionLost.into_error().is_machinery_fault());
    }

    #[tokio::test]
    async fn memory_breach_cancels_execution() {
        let probe = Arc::new(GrowingProbe {
            step: 4 * MIB,
            calls: AtomicU64::new(0),
        });
        let monitor = monitor(probe, Arc::new(EmergencyStop::new()));
        let cancel = CancellationToken::new();
        let handle = monitor.attach(ExecutionId::new(), limits(), process_scope(), cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        assert!(matches!(handle.stop().await, Some(Breach::Memory { .. })));
    }

    #[tokio::test]
    async fn probe_failures_fail_closed() {
        let probe = Arc::new(FlakyProbe {
            calls: AtomicU64::new(0),
        });
        let monitor = monitor(probe, Arc::new(EmergencyStop::new()));
        let cancel = CancellationToken::new();
        let handle = monitor.attach(ExecutionId::new(), limits(), process_scope(), cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        assert_eq!(handle.stop().await, Some(Breach::SupervisionLost));
        assert_eq!(monitor.breaker().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn emergency_stop_wakes_monitor() {
        let probe = Arc::new(GrowingProbe {
            step: 0,
            calls: AtomicU64::new(0),
        });
        let emergency = Arc::new(EmergencyStop::new());
        let monitor = monitor(probe, Arc::clone(&emergency));
        let cancel = CancellationToken::new();
        let handle = monitor.attach(ExecutionId::new(), limits(), process_scope(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        emergency.trigger("operator");
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        assert_eq!(
            handle.stop().await,
            Some(Breach::EmergencyStop {
                reason: "operator".into()
            })
        );
    }

    #[tokio::test]
    async fn unassigned_scope_is_not_sampled() {
        let probe = Arc::new(GrowingProbe {
            step: 64 * MIB,
            calls: AtomicU64::new(0),
        });
        let monitor = monitor(probe.clone(), Arc::new(EmergencyStop::new()));
        let cancel = CancellationToken::new();
        let scope = Arc::new(WorkerScope::new());
        let handle = monitor.attach(ExecutionId::new(), limits(), Arc::clone(&scope), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(!cancel.is_cancelled());

        scope.assign(SampleScope::Process);
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        assert!(matches!(handle.stop().await, Some(Breach::Memory { .. })));
    }

    #[tokio::test]
    async fn thread_scope_ignores_other_executions() {
        let monitor = monitor(Arc::new(SharedProcessProbe), Arc::new(EmergencyStop::new()));
        let cancel = CancellationToken::new();
        let strict = ResourceLimits {
            max_threads: 1,
            max_child_processes: 0,
            ..limits()
        };
        let scope = Arc::new(WorkerScope::assigned(SampleScope::Thread(4242)));
        let handle = monitor.attach(ExecutionId::new(), strict, scope, cancel.clone());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handle.stop().await, None);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stop_without_breach_reports_none() {
        let probe = Arc::new(GrowingProbe {
            step: 0,
            calls: AtomicU64::new(0),
        });
        let monitor = monitor(probe, Arc::new(EmergencyStop::new()));
        let cancel = CancellationToken::new();
        let handle = monitor.attach(ExecutionId::new(), limits(), process_scope(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.stop().await, None);
        assert!(!cancel.is_cancelled());
    }
}
