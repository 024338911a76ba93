//! Execution orchestrator.
//!
//! Composes admission, access control, loading, scanning, tier dispatch and
//! supervision into a single `run` call. Every resource taken on the way in
//! (slot, registry entry, monitor task) is an RAII guard, so every exit path
//! releases it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use threat_scanner::ThreatScanner;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::access::{AccessController, InMemoryPolicyProvider, PolicyProvider};
use crate::capability::{Closeable, ComponentHealth, HealthCheckable};
use crate::config::SandboxConfig;
use crate::engine::{ExpressionEngine, ScriptEngine};
use crate::error::{ExecutionError, SandboxError, SandboxResult, SecurityError};
use crate::events::{EventRegistry, MemoryAuditLog, SandboxEvent, TracingSink};
use crate::limits::ResourceLimits;
use crate::loader::{LoadedScript, SecureLoader};
use crate::monitor::{
    baseline, BreakerState, CircuitBreaker, EmergencyStop, ProcFsProbe, ResourceMonitor,
    ResourceProbe, WorkerScope,
};
use crate::registry::{ActiveExecution, ExecutionRegistry};
use crate::request::{ExecutionId, ExecutionRequest, ExecutionResult};
use crate::tier::{IsolationTier, RawResult, TierCapabilities, TierJob, TierKind, TierSelector};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// How the tier race ended, before breaches are taken into account.
enum TierOutcome {
    Finished(Result<RawResult, ExecutionError>),
    TimedOut(Duration),
    Cancelled,
}

pub struct SandboxOrchestrator {
    config: SandboxConfig,
    loader: SecureLoader,
    scanner: ThreatScanner,
    access: AccessController,
    tier: TierSelector,
    monitor: ResourceMonitor,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<ExecutionRegistry>,
    slots: Arc<Semaphore>,
    emergency: Arc<EmergencyStop>,
    events: Arc<EventRegistry>,
    audit_log: Option<Arc<MemoryAuditLog>>,
}

impl SandboxOrchestrator {
    pub fn builder(config: SandboxConfig) -> SandboxOrchestratorBuilder {
        SandboxOrchestratorBuilder::new(config)
    }

    /// Runs one request end to end. Never panics and never returns a raw
    /// error: failures come back as a typed [`ExecutionResult`].
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = ExecutionId::new();
        match self.run_with_id(execution_id, &request).await {
            Ok(value) => {
                counter!("sandbox_executions_total", 1, "outcome" => "success");
                ExecutionResult::success(execution_id, value)
            }
            Err(err) => {
                err.log_error();
                counter!("sandbox_executions_total", 1, "outcome" => err.kind().as_str());
                ExecutionResult::failure(execution_id, &err)
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            execution_id = %execution_id,
            user_id = %request.user_id,
            script_ref = %request.script_ref,
            tier = %self.tier.kind()
        )
    )]
    async fn run_with_id(
        &self,
        execution_id: ExecutionId,
        request: &ExecutionRequest,
    ) -> SandboxResult<Value> {
        if self.emergency.is_active() {
            return Err(ExecutionError::cancelled("emergency stop active").into());
        }

        request.validate_shape()?;
        let limits = request.limits.resolve(&self.config.default_limits);
        limits.validate_against(&self.config.ceilings)?;

        self.access
            .authorize(&request.user_id, &request.script_ref, &limits)
            .await?;

        let _slot = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(ExecutionError::ConcurrencyExceeded {
                    limit: self.config.max_concurrent_executions,
                }
                .into())
            }
            Err(TryAcquireError::Closed) => {
                return Err(ExecutionError::cancelled("sandbox is shutting down").into())
            }
        };

        let script = self.loader.load(&request.script_ref)?;
        let report = self.scanner.analyze(&script.content, script.display_name());
        if !report.is_safe() {
            counter!("sandbox_threats_blocked_total", 1);
            self.events.emit(SandboxEvent::ThreatBlocked {
                timestamp: Utc::now(),
                execution_id,
                user_id: request.user_id.clone(),
                script_ref: request.script_ref.clone(),
                max_severity: report.max_severity(),
                blocking_findings: report.blocking_findings().count(),
            });
            return Err(SecurityError::ThreatDetected {
                summary: report.summary(),
            }
            .into());
        }
        debug!(
            sha256 = %script.sha256,
            findings = report.findings().len(),
            "scan passed"
        );

        if !self.breaker.allow_request() {
            return Err(SandboxError::internal("circuit breaker open"));
        }
        let outcome = self.supervised(execution_id, request, limits, script).await;
        match &outcome {
            Err(err) if err.is_machinery_fault() => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }
        outcome
    }

    async fn supervised(
        &self,
        execution_id: ExecutionId,
        request: &ExecutionRequest,
        limits: ResourceLimits,
        script: LoadedScript,
    ) -> SandboxResult<Value> {
        let cancel = CancellationToken::new();
        let _lease = self.registry.register(ActiveExecution::new(
            execution_id,
            limits,
            self.tier.kind(),
            request.user_id.as_str(),
            request.script_ref.clone(),
            cancel.clone(),
        ))?;
        let scope = Arc::new(WorkerScope::new());
        let monitor = self.monitor.attach(execution_id, limits, Arc::clone(&scope), cancel.clone());

        let job = TierJob {
            execution_id,
            script_name: script.display_name().to_string(),
            code: Arc::from(script.content),
            entry_point: request.entry_point.clone(),
            params: request.params.clone(),
            limits,
            scope,
            cancel: cancel.clone(),
        };
        let budget = request.effective_timeout(&limits);

        let outcome = tokio::select! {
            result = timeout(budget, self.tier.execute(job)) => match result {
                Ok(finished) => TierOutcome::Finished(finished),
                Err(_) => TierOutcome::TimedOut(budget),
            },
            _ = cancel.cancelled() => TierOutcome::Cancelled,
        };
        // Stops in-process engines that are still running after a timeout.
        cancel.cancel();

        if let Some(breach) = monitor.stop().await {
            counter!("sandbox_breaches_total", 1, "kind" => breach.label());
            self.events.emit(SandboxEvent::Breach {
                timestamp: Utc::now(),
                execution_id,
                kind: breach.label().to_string(),
                detail: format!("{breach:?}"),
            });
            return Err(breach.into_error());
        }

        match outcome {
            TierOutcome::Finished(Ok(raw)) => {
                debug!(elapsed_ms = raw.elapsed.as_millis() as u64, "execution finished");
                Ok(raw.value)
            }
            TierOutcome::Finished(Err(ExecutionError::Cancelled { reason })) => {
                Err(self.cancellation_error(reason).into())
            }
            TierOutcome::Finished(Err(err)) => Err(err.into()),
            TierOutcome::TimedOut(budget) => Err(ExecutionError::Timeout {
                limit_secs: budget.as_secs_f64(),
            }
            .into()),
            TierOutcome::Cancelled => {
                Err(self.cancellation_error("execution cancelled".to_string()).into())
            }
        }
    }

    fn cancellation_error(&self, fallback: String) -> ExecutionError {
        match self.emergency.reason() {
            Some(reason) if self.emergency.is_active() => {
                ExecutionError::cancelled(format!("emergency stop: {reason}"))
            }
            _ => ExecutionError::cancelled(fallback),
        }
    }

    /// Sets the global stop flag and cancels every active execution. New
    /// work is rejected until [`SandboxOrchestrator::clear_emergency_stop`].
    /// Returns how many executions were cancelled.
    pub fn emergency_stop(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let first = self.emergency.trigger(reason.clone());
        let cancelled = self.registry.cancel_all();
        if first {
            self.events.emit(SandboxEvent::EmergencyStop {
                timestamp: Utc::now(),
                reason,
                cancelled,
            });
        }
        cancelled
    }

    pub fn clear_emergency_stop(&self) {
        self.emergency.clear();
    }

    /// Stops admitting work, cancels what is running and waits up to
    /// `grace` for it to drain.
    pub async fn shutdown(&self, grace: Duration) {
        self.slots.close();
        let cancelled = self.registry.cancel_all();
        info!("🛑 Sandbox shutting down, cancelled {} execution(s)", cancelled);

        let deadline = Instant::now() + grace;
        while !self.registry.is_empty() && Instant::now() < deadline {
            sleep(SHUTDOWN_POLL).await;
        }
        if self.registry.is_empty() {
            info!("✅ Sandbox shutdown complete");
        } else {
            warn!(
                "Sandbox shutdown grace elapsed with {} execution(s) still active",
                self.registry.len()
            );
        }
    }

    /// Per-component health.
    pub fn health(&self) -> Vec<ComponentHealth> {
        let mut report = vec![ComponentHealth::healthy(
            "tier",
            format!("{} selected", self.tier.kind()),
        )];
        for breaker in [&self.breaker, self.monitor.breaker()] {
            let snapshot = breaker.snapshot();
            let detail = format!("{:?}, {} failure(s)", snapshot.state, snapshot.failure_count);
            report.push(if snapshot.state == BreakerState::Closed {
                ComponentHealth::healthy(format!("breaker:{}", breaker.name()), detail)
            } else {
                ComponentHealth::unhealthy(format!("breaker:{}", breaker.name()), detail)
            });
        }
        report.push(match self.emergency.reason() {
            Some(reason) if self.emergency.is_active() => {
                ComponentHealth::unhealthy("emergency_stop", reason)
            }
            _ => ComponentHealth::healthy("emergency_stop", "clear"),
        });
        report.push(ComponentHealth::healthy(
            "registry",
            format!("{}/{} active", self.registry.len(), self.registry.max_active()),
        ));
        report.push(match baseline::baseline() {
            Some(base) => ComponentHealth::healthy(
                "baseline",
                format!("captured at {}", base.captured_at.to_rfc3339()),
            ),
            None => ComponentHealth::unhealthy("baseline", "not captured"),
        });
        report
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn tier_kind(&self) -> TierKind {
        self.tier.kind()
    }

    pub fn capabilities(&self) -> &TierCapabilities {
        self.tier.capabilities()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn monitor_breaker(&self) -> &Arc<CircuitBreaker> {
        self.monitor.breaker()
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    /// The retention sink, when the default event registry is in use.
    pub fn audit_log(&self) -> Option<&Arc<MemoryAuditLog>> {
        self.audit_log.as_ref()
    }

    pub fn emergency(&self) -> &Arc<EmergencyStop> {
        &self.emergency
    }
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("tier", &self.tier)
            .field("breaker", &self.breaker)
            .field("active", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl HealthCheckable for SandboxOrchestrator {
    async fn health_check(&self) -> ComponentHealth {
        let failing: Vec<String> = self
            .health()
            .into_iter()
            .filter(|c| !c.healthy)
            .map(|c| format!("{}: {}", c.component, c.detail))
            .collect();
        if failing.is_empty() {
            ComponentHealth::healthy("sandbox", format!("tier {}", self.tier.kind()))
        } else {
            ComponentHealth::unhealthy("sandbox", failing.join("; "))
        }
    }
}

#[async_trait]
impl Closeable for SandboxOrchestrator {
    async fn close(&self) {
        self.shutdown(Duration::from_secs(self.config.container.teardown_timeout_secs))
            .await;
    }
}

/// Assembles a [`SandboxOrchestrator`]. Anything not supplied gets the
/// production default.
pub struct SandboxOrchestratorBuilder {
    config: SandboxConfig,
    engine: Option<Arc<dyn ScriptEngine>>,
    policy_provider: Option<Arc<dyn PolicyProvider>>,
    events: Option<Arc<EventRegistry>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    tier: Option<Arc<dyn IsolationTier>>,
    emergency_stop: Option<Arc<EmergencyStop>>,
}

impl SandboxOrchestratorBuilder {
    fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            engine: None,
            policy_provider: None,
            events: None,
            probe: None,
            tier: None,
            emergency_stop: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn policy_provider(mut self, provider: Arc<dyn PolicyProvider>) -> Self {
        self.policy_provider = Some(provider);
        self
    }

    pub fn events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Skips capability probing and uses `tier` directly.
    pub fn tier(mut self, tier: Arc<dyn IsolationTier>) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn emergency_stop(mut self, stop: Arc<EmergencyStop>) -> Self {
        self.emergency_stop = Some(stop);
        self
    }

    pub async fn build(self) -> SandboxResult<SandboxOrchestrator> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| SandboxError::internal(format!("invalid configuration: {e}")))?;

        let loader = SecureLoader::new(&config.storage_root, config.max_script_bytes).map_err(|e| {
            SandboxError::internal(format!(
                "storage root {} unavailable: {e}",
                config.storage_root.display()
            ))
        })?;

        let (events, audit_log) = match self.events {
            Some(events) => (events, None),
            None => {
                let log = Arc::new(MemoryAuditLog::new(config.audit.retain_events));
                let events = EventRegistry::builder()
                    .on_all(Arc::new(TracingSink))
                    .on_all(log.clone())
                    .build()
                    .map_err(|e| SandboxError::internal(e.to_string()))?;
                (Arc::new(events), Some(log))
            }
        };

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcFsProbe::new()) as Arc<dyn ResourceProbe>);
        if baseline::capture(probe.as_ref()).is_none() {
            warn!("System baseline unavailable; monitors rely on attach-time samples");
        }

        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(ExpressionEngine::new()) as Arc<dyn ScriptEngine>);
        let tier = match self.tier {
            Some(tier) => TierSelector::with_tier(tier),
            None => TierSelector::probe(&config, engine, Arc::clone(&probe)).await?,
        };

        let provider = self.policy_provider.unwrap_or_else(|| {
            Arc::new(InMemoryPolicyProvider::from_policies(
                config.access.policies.iter().cloned(),
            )) as Arc<dyn PolicyProvider>
        });
        let emergency = self
            .emergency_stop
            .unwrap_or_else(|| Arc::new(EmergencyStop::new()));

        let breaker = Arc::new(
            CircuitBreaker::new("execution", &config.breaker).with_events(Arc::clone(&events)),
        );
        let monitor = ResourceMonitor::new(
            probe,
            config.monitor.clone(),
            &config.breaker,
            Arc::clone(&emergency),
        )
        .with_breaker(Arc::new(
            CircuitBreaker::new("monitor", &config.breaker).with_events(Arc::clone(&events)),
        ));

        info!(
            "✅ Sandbox orchestrator initialized (tier {}, {} slots)",
            tier.kind(),
            config.max_concurrent_executions
        );

        Ok(SandboxOrchestrator {
            loader,
            scanner: ThreatScanner::new(config.scanner_config()),
            access: AccessController::new(provider, Arc::clone(&events)),
            tier,
            monitor,
            breaker,
            registry: Arc::new(ExecutionRegistry::new(config.max_concurrent_executions)),
            slots: Arc::new(Semaphore::new(config.max_concurrent_executions)),
            emergency,
            events,
            audit_log,
            config,
        })
    }
}
