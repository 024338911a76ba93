//! Script engine capability.
//!
//! The sandbox never interprets scripts itself; it compiles and invokes them
//! through an injected [`ScriptEngine`]. [`ExpressionEngine`] is the
//! reference implementation used by the CLI and the in-process tiers.

mod expression;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::limits::ResourceLimits;
use crate::request::ExecutionId;

pub use expression::ExpressionEngine;

/// Built-ins an engine may expose to scripts. Nothing else is reachable.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs", "min", "max", "round", "len", "sum", "float", "int", "str", "bool",
];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("compile error{}: {message}", .line.map(|l| format!(" at line {l}")).unwrap_or_default())]
    Compile { line: Option<usize>, message: String },

    #[error("runtime error: {message}")]
    Runtime { message: String },

    /// The script outgrew a budget the engine enforces itself.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn compile<S: Into<String>>(line: Option<usize>, message: S) -> Self {
        Self::Compile {
            line,
            message: message.into(),
        }
    }

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    pub fn resource<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }
}

impl From<EngineError> for ExecutionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Compile { line, message } => ExecutionError::Compile { line, message },
            EngineError::Runtime { message } => ExecutionError::script(message),
            EngineError::ResourceExhausted { resource } => ExecutionError::resource(resource),
            EngineError::Cancelled => ExecutionError::cancelled("stopped by supervisor"),
        }
    }
}

/// Engine-specific compiled form of a script. Opaque to the sandbox.
pub struct CompiledUnit(Box<dyn Any + Send + Sync>);

impl CompiledUnit {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Box::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit").finish_non_exhaustive()
    }
}

/// What a running script can observe about its execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    cancel: CancellationToken,
    limits: Option<ResourceLimits>,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, cancel: CancellationToken) -> Self {
        Self {
            execution_id,
            cancel,
            limits: None,
        }
    }

    /// Budgets the engine must enforce itself. Without them the engine only
    /// applies its fixed caps.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Bytes of data the script may build.
    pub fn memory_budget(&self) -> Option<u64> {
        self.limits.map(|limits| limits.memory_bytes())
    }

    /// Stack of the thread the engine runs on.
    pub fn stack_bytes(&self) -> Option<u64> {
        self.limits.map(|limits| limits.stack_bytes())
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Engines call this between steps.
    pub fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn safe_builtins(&self) -> &'static [&'static str] {
        SAFE_BUILTINS
    }

    pub fn allows_builtin(&self, name: &str) -> bool {
        SAFE_BUILTINS.contains(&name)
    }
}

/// Compiles scripts and invokes named entry points.
///
/// Implementations must be deterministic given the same inputs and must poll
/// [`ExecutionContext::check_cancelled`] often enough that cancellation takes
/// effect within a sampling interval.
pub trait ScriptEngine: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, code: &str) -> Result<CompiledUnit, EngineError>;

    fn invoke(
        &self,
        unit: &CompiledUnit,
        entry_point: &str,
        params: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_unit_downcasts() {
        let unit = CompiledUnit::new(42u32);
        assert_eq!(unit.downcast_ref::<u32>(), Some(&42));
        assert!(unit.downcast_ref::<String>().is_none());
    }

    #[test]
    fn context_reflects_cancellation() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(ExecutionId::new(), token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert_eq!(ctx.check_cancelled(), Err(EngineError::Cancelled));
        assert!(ctx.allows_builtin("round"));
        assert!(!ctx.allows_builtin("open"));
    }

    #[test]
    fn engine_errors_map_to_execution_errors() {
        let err: ExecutionError = EngineError::compile(Some(2), "bad").into();
        assert_eq!(
            err,
            ExecutionError::Compile {
                line: Some(2),
                message: "bad".into()
            }
        );
        let err: ExecutionError = EngineError::runtime("boom").into();
        assert!(matches!(err, ExecutionError::ScriptFailure { .. }));
        let err: ExecutionError = EngineError::resource("memory").into();
        assert_eq!(err, ExecutionError::resource("memory"));
    }

    #[test]
    fn context_exposes_budgets_from_limits() {
        let ctx = ExecutionContext::new(ExecutionId::new(), CancellationToken::new());
        assert_eq!(ctx.memory_budget(), None);
        let ctx = ctx.with_limits(ResourceLimits {
            memory_mb: 16,
            stack_mb: 2,
            ..ResourceLimits::default()
        });
        assert_eq!(ctx.memory_budget(), Some(16 * 1024 * 1024));
        assert_eq!(ctx.stack_bytes(), Some(2 * 1024 * 1024));
    }
}
