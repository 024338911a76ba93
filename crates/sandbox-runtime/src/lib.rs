//! Runtime for untrusted strategy scripts.
//!
//! A request flows through [`SandboxOrchestrator::run`]: shape and limit
//! validation, an access decision, a non-blocking admission slot, the
//! [`SecureLoader`], the threat scanner, and finally the isolation tier
//! chosen at startup, supervised by a [`ResourceMonitor`]. Every failure
//! comes back as a typed [`ExecutionResult`] with a stable error kind.

pub mod access;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod limits;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod tier;

pub use access::{AccessController, AccessPolicy, InMemoryPolicyProvider, Permission, PolicyProvider, Role};
pub use capability::{Closeable, ComponentHealth, HealthCheckable};
pub use config::SandboxConfig;
pub use engine::{CompiledUnit, EngineError, ExecutionContext, ExpressionEngine, ScriptEngine, SAFE_BUILTINS};
pub use error::{ErrorKind, ExecutionError, SandboxError, SandboxResult, SecurityError};
pub use events::{AuditDecision, AuditEvent, EventCategory, EventHandler, EventRegistry, SandboxEvent};
pub use limits::{LimitOverrides, ResourceLimits};
pub use loader::{LoadedScript, SecureLoader};
pub use monitor::{
    install_signal_handlers, Breach, BreakerState, CircuitBreaker, EmergencyStop, ResourceMonitor,
    ResourceProbe, ResourceSample, SampleScope, SystemBaseline, WorkerScope,
};
pub use orchestrator::{SandboxOrchestrator, SandboxOrchestratorBuilder};
pub use registry::{ActiveExecution, ExecutionRegistry};
pub use request::{ErrorBody, ExecutionId, ExecutionRequest, ExecutionResult, ScriptRef};
pub use tier::{IsolationTier, RawResult, TierCapabilities, TierJob, TierKind, TierSelector};
