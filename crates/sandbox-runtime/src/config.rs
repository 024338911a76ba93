//! Sandbox configuration.
//!
//! Loaded once at startup from an optional TOML file and `SANDBOX__*`
//! environment variables (`__` separates nested keys, e.g.
//! `SANDBOX__BREAKER__FAILURE_THRESHOLD=5`). Nothing is hot-reloaded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use threat_scanner::{ScannerConfig, Severity, ThreatCategory, DEFAULT_LARGE_ALLOCATION_THRESHOLD};
use tracing::{info, warn};

use crate::access::AccessPolicy;
use crate::limits::ResourceLimits;
use crate::tier::TierKind;

/// Top-level sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory scripts are resolved against
    pub storage_root: PathBuf,

    /// Largest script the loader will read
    pub max_script_bytes: u64,

    /// Admission semaphore size; also the registry's hard ceiling
    pub max_concurrent_executions: usize,

    /// Forced isolation tier; strongest available when unset
    pub preferred_tier: Option<TierKind>,

    /// Administrative ceilings every request is checked against
    pub ceilings: ResourceLimits,

    /// Limits used for fields a request leaves out
    pub default_limits: ResourceLimits,

    /// Per-category severity replacements applied by the scanner, keyed by
    /// category name (`crypto_usage = "high"`)
    pub severity_overrides: HashMap<String, Severity>,

    pub scanner: ScannerSection,
    pub monitor: MonitorConfig,
    pub breaker: BreakerConfig,
    pub container: ContainerConfig,
    pub cgroup: CgroupConfig,
    pub audit: AuditConfig,
    pub access: AccessConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./scripts"),
            max_script_bytes: 64 * 1024,
            max_concurrent_executions: 5,
            preferred_tier: None,
            ceilings: ResourceLimits::default_ceilings(),
            default_limits: ResourceLimits::default(),
            severity_overrides: HashMap::new(),
            scanner: ScannerSection::default(),
            monitor: MonitorConfig::default(),
            breaker: BreakerConfig::default(),
            container: ContainerConfig::default(),
            cgroup: CgroupConfig::default(),
            audit: AuditConfig::default(),
            access: AccessConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Loads from `path` (optional) and the environment, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("config/sandbox").required(false)),
        };
        let config = builder
            .add_source(
                Environment::with_prefix("SANDBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let sandbox_config: SandboxConfig = config.try_deserialize()?;
        sandbox_config.validate()?;

        info!("Sandbox configuration loaded:");
        info!("  Storage root: {}", sandbox_config.storage_root.display());
        info!(
            "  Max concurrent executions: {}",
            sandbox_config.max_concurrent_executions
        );
        info!(
            "  Preferred tier: {}",
            sandbox_config
                .preferred_tier
                .map(|t| t.as_str())
                .unwrap_or("auto")
        );
        info!("  Static access policies: {}", sandbox_config.access.policies.len());
        if sandbox_config.container.network_enabled {
            warn!("Container networking is enabled; scripts can reach the network");
        }

        Ok(sandbox_config)
    }

    /// Validates the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::Message(
                "storage_root cannot be empty".to_string(),
            ));
        }
        if self.max_script_bytes == 0 {
            return Err(ConfigError::Message(
                "max_script_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::Message(
                "max_concurrent_executions must be greater than 0".to_string(),
            ));
        }
        if let Some((field, value)) = self.ceilings.fields().into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Message(format!(
                "ceiling `{field}` must be positive, got {value}"
            )));
        }
        self.default_limits
            .validate_against(&self.ceilings)
            .map_err(|e| ConfigError::Message(format!("default_limits: {e}")))?;
        if let Some(unknown) = self
            .severity_overrides
            .keys()
            .find(|key| parse_category(key).is_none())
        {
            return Err(ConfigError::Message(format!(
                "severity_overrides: unknown threat category `{unknown}`"
            )));
        }
        if self.monitor.sample_interval_ms == 0 {
            return Err(ConfigError::Message(
                "monitor.sample_interval_ms must be greater than 0".to_string(),
            ));
        }
        if !(self.monitor.growth_warning_fraction > 0.0 && self.monitor.growth_warning_fraction <= 1.0)
        {
            return Err(ConfigError::Message(
                "monitor.growth_warning_fraction must be in (0, 1]".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_successes == 0 {
            return Err(ConfigError::Message(
                "breaker thresholds must be greater than 0".to_string(),
            ));
        }
        if self.audit.retain_events == 0 {
            return Err(ConfigError::Message(
                "audit.retain_events must be greater than 0".to_string(),
            ));
        }
        if self.container.runtime.trim().is_empty() || self.container.image.trim().is_empty() {
            return Err(ConfigError::Message(
                "container.runtime and container.image cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Scanner settings assembled from the top-level overrides and the
    /// `scanner` section.
    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            severity_overrides: self
                .severity_overrides
                .iter()
                .filter_map(|(key, severity)| parse_category(key).map(|c| (c, *severity)))
                .collect(),
            large_allocation_threshold: self.scanner.large_allocation_threshold,
            extra_identifier_denylist: self.scanner.extra_identifier_denylist.clone(),
        }
    }
}

fn parse_category(name: &str) -> Option<ThreatCategory> {
    ThreatCategory::ALL
        .into_iter()
        .find(|category| category.as_str() == name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    pub large_allocation_threshold: u64,
    pub extra_identifier_denylist: Vec<String>,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            large_allocation_threshold: DEFAULT_LARGE_ALLOCATION_THRESHOLD,
            extra_identifier_denylist: Vec::new(),
        }
    }
}

/// Per-execution monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_ms: u64,
    pub growth_window_secs: u64,
    /// Fraction of the memory limit that RSS may grow by within the window
    /// before a warning is logged
    pub growth_warning_fraction: f64,
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn growth_window(&self) -> Duration {
        Duration::from_secs(self.growth_window_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            growth_window_secs: 3,
            growth_warning_fraction: 0.5,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_successes: u32,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30,
            half_open_successes: 2,
        }
    }
}

/// Container tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime CLI
    pub runtime: String,
    pub image: String,
    /// Interpreter inside the image that runs the mounted runner
    pub interpreter: String,
    pub network_enabled: bool,
    pub tmpfs_mb: u64,
    /// Upper bound on the forced removal after every run
    pub teardown_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-alpine".to_string(),
            interpreter: "python3".to_string(),
            network_enabled: false,
            tmpfs_mb: 16,
            teardown_timeout_secs: 5,
        }
    }
}

/// Cgroup tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Parent group the ephemeral groups are created under
    pub root: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup/strategy-sandbox"),
        }
    }
}

/// Audit sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Events kept by the in-memory retention sink
    pub retain_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retain_events: 1000,
        }
    }
}

/// Static policies for the CLI and tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub policies: Vec<AccessPolicy>,
}
