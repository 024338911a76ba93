//! cgroup v2 tier.
//!
//! Runs the engine in-process like the rlimit tier, but first moves the whole
//! sandbox process into an ephemeral child group whose `memory.high` and
//! `pids.max` are the usage at entry plus the execution's budget. Executions
//! are serialized because the group applies to every thread of the process.
//!
//! The group holds the service itself, so memory is capped with
//! `memory.high`: past it the kernel throttles and reclaims instead of
//! OOM-killing the process, and the `high` event counter turns the execution
//! into `resource_exceeded`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{run_in_process, IsolationTier, RawResult, TierJob, TierKind};
use crate::engine::ScriptEngine;
use crate::error::ExecutionError;
use crate::limits::ResourceLimits;
use crate::monitor::{ResourceProbe, ResourceSample};

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_US: u64 = 100_000;

pub struct CgroupTier {
    root: PathBuf,
    engine: Arc<dyn ScriptEngine>,
    probe: Arc<dyn ResourceProbe>,
    serial: Mutex<()>,
}

impl CgroupTier {
    pub fn new(root: PathBuf, engine: Arc<dyn ScriptEngine>, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            root,
            engine,
            probe,
            serial: Mutex::new(()),
        }
    }

    /// Whether cgroup v2 is mounted and `root` can host groups with the
    /// memory and pids controllers.
    pub fn probe(root: &Path) -> bool {
        if !cfg!(target_os = "linux") {
            return false;
        }
        if !Path::new(CGROUP_MOUNT).join("cgroup.controllers").exists() {
            debug!("cgroup v2 is not mounted at {}", CGROUP_MOUNT);
            return false;
        }
        if let Err(e) = fs::create_dir_all(root) {
            debug!("Cannot create cgroup root {}: {}", root.display(), e);
            return false;
        }
        match enable_controllers(root) {
            Ok(()) => true,
            Err(e) => {
                debug!("Cannot delegate controllers under {}: {}", root.display(), e);
                false
            }
        }
    }
}

#[async_trait]
impl IsolationTier for CgroupTier {
    fn kind(&self) -> TierKind {
        TierKind::Cgroup
    }

    async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError> {
        let _serial = self.serial.lock().await;

        let sample = self.probe.sample().map_err(|e| {
            warn!("Cannot measure usage before entering cgroup: {}", e);
            ExecutionError::tier_failure("resource usage unavailable")
        })?;
        let original = current_group().map_err(|e| {
            warn!("Cannot determine current cgroup: {}", e);
            ExecutionError::tier_failure("cannot determine current cgroup")
        })?;

        let name = format!("exec-{}", job.execution_id);
        let group = EphemeralGroup::create(&self.root, &name, original, &sample, &job.limits)?;
        group.enter()?;

        let outcome = run_in_process(Arc::clone(&self.engine), job).await;

        let over_high = group.memory_high_events();
        drop(group);
        if over_high > 0 {
            debug!(over_high, "execution went over its cgroup memory.high");
            return Err(ExecutionError::resource("memory (cgroup limit reached)"));
        }
        outcome
    }
}

/// Child group that the process sits in for one execution. Dropping it moves
/// the process back to its original group and removes the directory.
#[derive(Debug)]
struct EphemeralGroup {
    path: PathBuf,
    original: PathBuf,
    pid: u32,
}

impl EphemeralGroup {
    fn create(
        root: &Path,
        name: &str,
        original: PathBuf,
        sample: &ResourceSample,
        limits: &ResourceLimits,
    ) -> Result<Self, ExecutionError> {
        let path = root.join(name);
        fs::create_dir(&path).map_err(|e| {
            warn!("Failed to create cgroup {}: {}", path.display(), e);
            ExecutionError::tier_failure("cannot create cgroup")
        })?;
        let group = Self {
            path,
            original,
            pid: std::process::id(),
        };

        let memory_high = sample.rss_bytes.saturating_add(limits.memory_bytes());
        // The worker thread itself is one more task.
        let pids_max = sample
            .threads
            .saturating_add(limits.max_threads)
            .saturating_add(limits.max_child_processes)
            .saturating_add(1);

        group.write("memory.high", &memory_high.to_string())?;
        group.write("pids.max", &pids_max.to_string())?;
        group.write_optional("memory.swap.max", "0");
        group.write_optional("cpu.max", &format!("{CPU_PERIOD_US} {CPU_PERIOD_US}"));

        debug!(
            cgroup = %group.path.display(),
            memory_high,
            pids_max,
            "ephemeral cgroup configured"
        );
        Ok(group)
    }

    fn enter(&self) -> Result<(), ExecutionError> {
        self.write("cgroup.procs", &self.pid.to_string())
    }

    fn write(&self, file: &str, value: &str) -> Result<(), ExecutionError> {
        fs::write(self.path.join(file), value).map_err(|e| {
            warn!("Failed to set {} on {}: {}", file, self.path.display(), e);
            ExecutionError::tier_failure(format!("cannot set {file}"))
        })
    }

    /// Controllers that may be missing (no swap accounting, no cpu
    /// delegation) are skipped.
    fn write_optional(&self, file: &str, value: &str) {
        if let Err(e) = fs::write(self.path.join(file), value) {
            debug!("Skipping {} on {}: {}", file, self.path.display(), e);
        }
    }

    /// Times usage went over `memory.high` while the group existed.
    fn memory_high_events(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|content| event_counter(&content, "high"))
            .unwrap_or(0)
    }
}

impl Drop for EphemeralGroup {
    fn drop(&mut self) {
        let procs = self.original.join("cgroup.procs");
        if let Err(e) = fs::write(&procs, self.pid.to_string()) {
            warn!("Failed to move process back to {}: {}", self.original.display(), e);
        }
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
        }
    }
}

/// Turns on the memory and pids controllers (and cpu when offered) for
/// children of `root`.
fn enable_controllers(root: &Path) -> io::Result<()> {
    let available = fs::read_to_string(root.join("cgroup.controllers"))?;
    let offered: Vec<&str> = available.split_whitespace().collect();
    for required in ["memory", "pids"] {
        if !offered.contains(&required) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("controller `{required}` not delegated"),
            ));
        }
    }

    let current = fs::read_to_string(root.join("cgroup.subtree_control")).unwrap_or_default();
    let wanted: Vec<String> = ["memory", "pids", "cpu"]
        .into_iter()
        .filter(|c| offered.contains(c) && !current.split_whitespace().any(|e| e == *c))
        .map(|c| format!("+{c}"))
        .collect();
    if !wanted.is_empty() {
        fs::write(root.join("cgroup.subtree_control"), wanted.join(" "))?;
        info!("Enabled cgroup controllers under {}: {}", root.display(), wanted.join(" "));
    }
    Ok(())
}

fn current_group() -> io::Result<PathBuf> {
    let content = fs::read_to_string("/proc/self/cgroup")?;
    parse_unified_group(&content)
        .map(|relative| Path::new(CGROUP_MOUNT).join(relative))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no cgroup v2 entry"))
}

/// Path of the unified (`0::`) hierarchy entry, relative to the mount.
fn parse_unified_group(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().trim_start_matches('/'))
}

fn event_counter(content: &str, name: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_unified_hierarchy_entry() {
        let content = "12:pids:/legacy\n0::/user.slice/session-3.scope\n";
        assert_eq!(parse_unified_group(content), Some("user.slice/session-3.scope"));
        assert_eq!(parse_unified_group("0::/\n"), Some(""));
        assert_eq!(parse_unified_group("4:memory:/x\n"), None);
    }

    #[test]
    fn reads_memory_event_counters() {
        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n";
        assert_eq!(event_counter(events, "oom_kill"), 1);
        assert_eq!(event_counter(events, "max"), 3);
        assert_eq!(event_counter(events, "missing"), 0);
    }

    #[test]
    fn group_limits_are_relative_to_entry_usage() {
        let root = tempfile::tempdir().unwrap();
        let original = tempfile::tempdir().unwrap();
        let sample = ResourceSample {
            rss_bytes: 1000,
            threads: 4,
            ..ResourceSample::default()
        };
        let limits = ResourceLimits {
            memory_mb: 2,
            max_threads: 3,
            max_child_processes: 1,
            ..ResourceLimits::default()
        };

        let group = EphemeralGroup::create(
            root.path(),
            "exec-test",
            original.path().to_path_buf(),
            &sample,
            &limits,
        )
        .unwrap();
        let dir = root.path().join("exec-test");
        let read = |file: &str| fs::read_to_string(dir.join(file)).unwrap();
        assert_eq!(read("memory.high"), (1000 + 2 * 1024 * 1024).to_string());
        assert!(!dir.join("memory.max").exists());
        assert_eq!(read("pids.max"), "9");
        assert_eq!(read("cpu.max"), "100000 100000");

        group.enter().unwrap();
        assert_eq!(read("cgroup.procs"), std::process::id().to_string());
        assert_eq!(group.memory_high_events(), 0);
        fs::write(dir.join("memory.events"), "low 0\nhigh 3\nmax 0\noom 0\noom_kill 0\n").unwrap();
        assert_eq!(group.memory_high_events(), 3);

        drop(group);
        let moved_back = fs::read_to_string(original.path().join("cgroup.procs")).unwrap();
        assert_eq!(moved_back, std::process::id().to_string());
    }

    #[test]
    fn missing_root_fails_as_tier_failure() {
        let err = EphemeralGroup::create(
            Path::new("/nonexistent/sandbox-root"),
            "exec-x",
            PathBuf::from("/nonexistent"),
            &ResourceSample::default(),
            &ResourceLimits::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::TierFailure { .. }));
    }
}
