//! Inbound requests and outbound results.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorKind, SandboxError, SecurityError};
use crate::limits::{LimitOverrides, ResourceLimits};

/// Opaque reference to a script in the external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptRef(String);

impl ScriptRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ScriptRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier assigned to every execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn default_timeout() -> f64 {
    10.0
}

/// A request to run one entry point of one script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub script_ref: ScriptRef,
    pub entry_point: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub limits: LimitOverrides,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    pub user_id: String,
}

impl ExecutionRequest {
    pub fn new(
        script_ref: impl Into<ScriptRef>,
        entry_point: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            script_ref: script_ref.into(),
            entry_point: entry_point.into(),
            params: BTreeMap::new(),
            limits: LimitOverrides::default(),
            timeout_seconds: default_timeout(),
            user_id: user_id.into(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits.into();
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Shape checks that do not depend on configuration.
    pub fn validate_shape(&self) -> Result<(), SecurityError> {
        if !is_identifier(&self.entry_point) {
            return Err(SecurityError::validation(
                "entry_point must be a plain identifier",
                Some("entry_point"),
            ));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(SecurityError::validation(
                "timeout_seconds must be a finite positive number",
                Some("timeout_seconds"),
            ));
        }
        if self.user_id.trim().is_empty() {
            return Err(SecurityError::validation(
                "user_id must not be empty",
                Some("user_id"),
            ));
        }
        if let Some(name) = self.params.keys().find(|k| !is_identifier(k)) {
            return Err(SecurityError::validation(
                format!("parameter name `{}` is not an identifier", truncate(name, 32)),
                Some("params"),
            ));
        }
        Ok(())
    }

    /// `min(timeout_seconds, wall_seconds)`.
    pub fn effective_timeout(&self, limits: &ResourceLimits) -> Duration {
        let requested = Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(Duration::MAX);
        requested.min(limits.wall_duration())
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 128
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Error half of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outbound result. Exactly one of `value` and `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<ErrorBody>,
    pub execution_id: ExecutionId,
}

impl ExecutionResult {
    pub fn success(execution_id: ExecutionId, value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            execution_id,
        }
    }

    pub fn failure(execution_id: ExecutionId, error: &SandboxError) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(ErrorBody {
                kind: error.kind(),
                message: error.public_message(),
            }),
            execution_id,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
