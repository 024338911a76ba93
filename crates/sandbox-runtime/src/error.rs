//! Error taxonomy for the sandbox.
//!
//! Every failure carries a stable [`ErrorKind`] and a message that is safe
//! to hand back to the submitter: no host paths, no OS error strings, no
//! backtraces. Detail that would leak lives only in logs.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Stable, caller-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    ThreatDetected,
    AccessDenied,
    ConcurrencyExceeded,
    Timeout,
    ResourceExceeded,
    TierUnavailable,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::ThreatDetected => "threat_detected",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::ConcurrencyExceeded => "concurrency_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::TierUnavailable => "tier_unavailable",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pre-execution rejection. Never retried, always fails closed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SecurityError {
    #[error("Invalid script reference: {reason}")]
    InvalidReference { reason: String },

    #[error("Script reference escapes the storage root")]
    OutsideRoot,

    #[error("Script not found")]
    NotFound,

    #[error("Script is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Script is not valid UTF-8")]
    InvalidEncoding,

    #[error("Script could not be read")]
    Unreadable,

    #[error("Request validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Limit `{field}` = {value} exceeds ceiling {ceiling}")]
    LimitExceedsCeiling {
        field: &'static str,
        value: u64,
        ceiling: u64,
    },

    #[error("Script rejected by threat scan: {summary}")]
    ThreatDetected { summary: String },

    #[error("Access denied: {reason}")]
    AccessDenied { reason: String },
}

impl SecurityError {
    pub fn invalid_reference<S: Into<String>>(reason: S) -> Self {
        Self::InvalidReference {
            reason: reason.into(),
        }
    }

    pub fn validation<S: Into<String>>(message: S, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    pub fn access_denied<S: Into<String>>(reason: S) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::InvalidReference { .. } | SecurityError::OutsideRoot => {
                ErrorKind::AccessDenied
            }
            SecurityError::AccessDenied { .. } => ErrorKind::AccessDenied,
            SecurityError::ThreatDetected { .. } => ErrorKind::ThreatDetected,
            SecurityError::NotFound
            | SecurityError::TooLarge { .. }
            | SecurityError::InvalidEncoding
            | SecurityError::Unreadable
            | SecurityError::Validation { .. }
            | SecurityError::LimitExceedsCeiling { .. } => ErrorKind::ValidationFailed,
        }
    }
}

/// Execution-time failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Execution exceeded its {limit_secs:.3}s time limit")]
    Timeout { limit_secs: f64 },

    #[error("Resource limit exceeded: {resource}")]
    ResourceExceeded { resource: String },

    #[error("Too many concurrent executions (limit {limit})")]
    ConcurrencyExceeded { limit: usize },

    #[error("Isolation tier `{tier}` is unavailable")]
    TierUnavailable { tier: String },

    #[error("Isolation tier failed: {message}")]
    TierFailure { message: String },

    #[error("Script does not compile{}: {message}", .line.map(|l| format!(" (line {l})")).unwrap_or_default())]
    Compile { line: Option<usize>, message: String },

    /// The script's own code raised. Reported as `internal_error` for lack of
    /// a closer kind; the message says whose fault it was.
    #[error("Script raised an error (not a sandbox fault): {message}")]
    ScriptFailure { message: String },

    #[error("Execution cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ExecutionError {
    pub fn resource<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExceeded {
            resource: resource.into(),
        }
    }

    pub fn tier_failure<S: Into<String>>(message: S) -> Self {
        Self::TierFailure {
            message: message.into(),
        }
    }

    pub fn script<S: Into<String>>(message: S) -> Self {
        Self::ScriptFailure {
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            ExecutionError::ConcurrencyExceeded { .. } => ErrorKind::ConcurrencyExceeded,
            ExecutionError::TierUnavailable { .. } => ErrorKind::TierUnavailable,
            ExecutionError::Compile { .. } => ErrorKind::ValidationFailed,
            ExecutionError::TierFailure { .. }
            | ExecutionError::ScriptFailure { .. }
            | ExecutionError::Cancelled { .. } => ErrorKind::InternalError,
        }
    }
}

/// Top-level sandbox error.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Fault in the sandbox machinery itself. The message is for logs only.
    #[error("Internal sandbox error: {message}")]
    Internal { message: String },
}

impl SandboxError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Security(e) => e.kind(),
            SandboxError::Execution(e) => e.kind(),
            SandboxError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Message safe to return to the submitter.
    pub fn public_message(&self) -> String {
        match self {
            SandboxError::Internal { .. } => "Internal sandbox error".to_string(),
            SandboxError::Execution(ExecutionError::TierFailure { .. }) => {
                "Isolation tier failed".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Faults of the sandbox machinery, as opposed to faults of the script
    /// or the request. Only these count against the circuit breaker.
    pub fn is_machinery_fault(&self) -> bool {
        matches!(
            self,
            SandboxError::Internal { .. } | SandboxError::Execution(ExecutionError::TierFailure { .. })
        )
    }

    /// Logs at a level matching the severity of the failure.
    pub fn log_error(&self) {
        match self {
            SandboxError::Internal { message } => error!("Internal sandbox error: {}", message),
            SandboxError::Execution(ExecutionError::TierFailure { message }) => {
                error!("Isolation tier failure: {}", message)
            }
            SandboxError::Security(SecurityError::ThreatDetected { summary }) => {
                warn!("Script blocked by threat scan: {}", summary)
            }
            SandboxError::Security(SecurityError::AccessDenied { reason }) => {
                warn!("Access denied: {}", reason)
            }
            SandboxError::Execution(ExecutionError::ResourceExceeded { resource }) => {
                warn!("Resource limit exceeded: {}", resource)
            }
            SandboxError::Execution(ExecutionError::ScriptFailure { message }) => {
                warn!("Script raised an error: {}", message)
            }
            _ => debug!("Execution rejected: {}", self),
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
