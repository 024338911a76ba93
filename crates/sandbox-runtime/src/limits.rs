//! Per-execution resource limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

const MIB: u64 = 1024 * 1024;

/// Resource budget of a single execution. Every field is a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_seconds: u64,
    pub wall_seconds: u64,
    pub max_open_files: u64,
    pub max_threads: u64,
    pub max_child_processes: u64,
    pub stack_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_seconds: 5,
            wall_seconds: 10,
            max_open_files: 64,
            max_threads: 4,
            max_child_processes: 1,
            stack_mb: 8,
        }
    }
}

impl ResourceLimits {
    /// Administrative ceilings shipped as defaults.
    pub fn default_ceilings() -> Self {
        Self {
            memory_mb: 512,
            cpu_seconds: 30,
            wall_seconds: 60,
            max_open_files: 256,
            max_threads: 16,
            max_child_processes: 8,
            stack_mb: 64,
        }
    }

    pub fn fields(&self) -> [(&'static str, u64); 7] {
        [
            ("memory_mb", self.memory_mb),
            ("cpu_seconds", self.cpu_seconds),
            ("wall_seconds", self.wall_seconds),
            ("max_open_files", self.max_open_files),
            ("max_threads", self.max_threads),
            ("max_child_processes", self.max_child_processes),
            ("stack_mb", self.stack_mb),
        ]
    }

    /// Rejects zero fields and anything above `ceilings`. Never clamps.
    pub fn validate_against(&self, ceilings: &ResourceLimits) -> Result<(), SecurityError> {
        for ((field, value), (_, ceiling)) in self.fields().into_iter().zip(ceilings.fields()) {
            if value == 0 {
                return Err(SecurityError::validation(
                    format!("limit `{field}` must be positive"),
                    Some(field),
                ));
            }
            if value > ceiling {
                return Err(SecurityError::LimitExceedsCeiling {
                    field,
                    value,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    /// First field that exceeds `ceilings`, if any.
    pub fn first_excess(&self, ceilings: &ResourceLimits) -> Option<(&'static str, u64, u64)> {
        self.fields()
            .into_iter()
            .zip(ceilings.fields())
            .find(|((_, value), (_, ceiling))| value > ceiling)
            .map(|((field, value), (_, ceiling))| (field, value, ceiling))
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(MIB)
    }

    pub fn stack_bytes(&self) -> u64 {
        self.stack_mb.saturating_mul(MIB)
    }

    pub fn wall_duration(&self) -> Duration {
        Duration::from_secs(self.wall_seconds)
    }

    pub fn cpu_duration(&self) -> Duration {
        Duration::from_secs(self.cpu_seconds)
    }
}

/// Limits as submitted. Missing fields take the configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitOverrides {
    pub memory_mb: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub wall_seconds: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_threads: Option<u64>,
    pub max_child_processes: Option<u64>,
    pub stack_mb: Option<u64>,
}

impl LimitOverrides {
    pub fn resolve(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            cpu_seconds: self.cpu_seconds.unwrap_or(defaults.cpu_seconds),
            wall_seconds: self.wall_seconds.unwrap_or(defaults.wall_seconds),
            max_open_files: self.max_open_files.unwrap_or(defaults.max_open_files),
            max_threads: self.max_threads.unwrap_or(defaults.max_threads),
            max_child_processes: self
                .max_child_processes
                .unwrap_or(defaults.max_child_processes),
            stack_mb: self.stack_mb.unwrap_or(defaults.stack_mb),
        }
    }
}

impl From<ResourceLimits> for LimitOverrides {
    fn from(limits: ResourceLimits) -> Self {
        Self {
            memory_mb: Some(limits.memory_mb),
            cpu_seconds: Some(limits.cpu_seconds),
            wall_seconds: Some(limits.wall_seconds),
            max_open_files: Some(limits.max_open_files),
            max_threads: Some(limits.max_threads),
            max_child_processes: Some(limits.max_child_processes),
            stack_mb: Some(limits.stack_mb),
        }
    }
}
