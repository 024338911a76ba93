//! Container tier: one throwaway container per execution.
//!
//! The scanned code, the call's input and a small runner are written to a
//! private temp directory that is bind-mounted read-only. The container has
//! no network (unless configured), no capabilities, a read-only root, an
//! unprivileged user and the execution's limits as runtime flags. It is
//! force-removed after every run, including cancelled ones.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{IsolationTier, RawResult, TierJob, TierKind};
use crate::config::ContainerConfig;
use crate::error::ExecutionError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MOUNT_POINT: &str = "/sandbox";
const NOBODY: &str = "65534:65534";

/// Exit status the runtime reports when the kernel OOM-killed the container.
const EXIT_OOM_KILLED: i32 = 137;

/// Interpreter-side half of the protocol: reads `input.json`, compiles
/// `script.py` with only the safe built-ins, calls the entry point and prints
/// one JSON line.
const RUNNER: &str = r#"import json, sys

SAFE = ("abs", "min", "max", "round", "len", "sum", "float", "int", "str", "bool",
        "range", "enumerate", "zip", "sorted", "reversed", "list", "dict", "tuple")

def emit(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def main():
    with open("/sandbox/input.json") as fh:
        call = json.load(fh)
    with open("/sandbox/script.py") as fh:
        source = fh.read()
    try:
        code = compile(source, "script.py", "exec")
    except SyntaxError as err:
        emit({"ok": False, "kind": "compile", "line": err.lineno, "error": str(err.msg)})
        return
    import builtins
    scope = {"__builtins__": {name: getattr(builtins, name) for name in SAFE}}
    try:
        exec(code, scope)
        entry = scope.get(call["entry_point"])
        if not callable(entry):
            raise NameError("entry point `%s` is not defined" % call["entry_point"])
        value = entry(**call["params"])
        emit({"ok": True, "value": value})
    except Exception as err:
        emit({"ok": False, "kind": "runtime", "error": "%s: %s" % (type(err).__name__, err)})

main()
"#;

pub struct ContainerTier {
    config: ContainerConfig,
}

impl ContainerTier {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Whether the runtime CLI is installed and its daemon answers.
    pub async fn probe(config: &ContainerConfig) -> bool {
        let mut command = Command::new(&config.runtime);
        command
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match timeout(PROBE_TIMEOUT, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(
                    "Container runtime {} reachable (server {})",
                    config.runtime,
                    String::from_utf8_lossy(&output.stdout).trim()
                );
                true
            }
            Ok(Ok(output)) => {
                debug!("Container runtime {} not usable: {}", config.runtime, output.status);
                false
            }
            Ok(Err(e)) => {
                debug!("Container runtime {} not found: {}", config.runtime, e);
                false
            }
            Err(_) => {
                debug!("Container runtime {} did not answer in time", config.runtime);
                false
            }
        }
    }

    fn run_args(&self, name: &str, job: &TierJob, workdir: &Path) -> Vec<String> {
        let limits = &job.limits;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            name.into(),
            "--rm".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--user".into(),
            NOBODY.into(),
        ];
        if !self.config.network_enabled {
            args.extend(["--network".into(), "none".into()]);
        }
        let pids = limits
            .max_threads
            .saturating_add(limits.max_child_processes)
            .saturating_add(1);
        args.extend([
            "--memory".into(),
            format!("{}m", limits.memory_mb),
            "--memory-swap".into(),
            format!("{}m", limits.memory_mb),
            "--cpus".into(),
            "1".into(),
            "--pids-limit".into(),
            pids.to_string(),
            "--ulimit".into(),
            format!("nofile={0}:{0}", limits.max_open_files),
            "--ulimit".into(),
            format!("cpu={0}:{0}", limits.cpu_seconds),
            "--ulimit".into(),
            format!("stack={0}:{0}", limits.stack_bytes()),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}m", self.config.tmpfs_mb),
            "-v".into(),
            format!("{}:{}:ro", workdir.display(), MOUNT_POINT),
            self.config.image.clone(),
            self.config.interpreter.clone(),
            format!("{MOUNT_POINT}/runner.py"),
        ]);
        args
    }

    fn stage(&self, job: &TierJob) -> Result<TempDir, ExecutionError> {
        let stage_err = |e: std::io::Error| {
            warn!("Failed to stage container files: {}", e);
            ExecutionError::tier_failure("cannot stage container files")
        };
        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(stage_err)?;
        let input = json!({
            "entry_point": job.entry_point,
            "params": job.params,
        });
        std::fs::write(dir.path().join("script.py"), job.code.as_bytes()).map_err(stage_err)?;
        std::fs::write(dir.path().join("input.json"), input.to_string()).map_err(stage_err)?;
        std::fs::write(dir.path().join("runner.py"), RUNNER).map_err(stage_err)?;
        make_readable(dir.path()).map_err(stage_err)?;
        Ok(dir)
    }
}

#[async_trait]
impl IsolationTier for ContainerTier {
    fn kind(&self) -> TierKind {
        TierKind::Container
    }

    async fn execute(&self, job: TierJob) -> Result<RawResult, ExecutionError> {
        let workdir = self.stage(&job)?;
        let name = format!("sandbox-{}", job.execution_id);
        let args = self.run_args(&name, &job, workdir.path());

        let mut command = Command::new(&self.config.runtime);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let guard = ContainerGuard::new(&self.config, name);
        let started = Instant::now();
        let child = command.spawn().map_err(|e| {
            warn!("Failed to start {}: {}", self.config.runtime, e);
            ExecutionError::tier_failure("cannot start container runtime")
        })?;
        info!(container = %guard.name, "📦 Container started for {}", job.script_name);

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| {
                warn!("Lost container {}: {}", guard.name, e);
                ExecutionError::tier_failure("container runtime failed")
            }),
            _ = job.cancel.cancelled() => Err(ExecutionError::cancelled("stopped by supervisor")),
        };
        guard.teardown().await;
        let output = output?;
        let elapsed = started.elapsed();

        if !output.stderr.is_empty() {
            debug!(
                "container stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match output.status.code() {
            Some(0) => parse_runner_output(&stdout).map(|value| RawResult { value, elapsed }),
            Some(EXIT_OOM_KILLED) => Err(ExecutionError::resource("memory (container killed)")),
            // The runtime itself could not create or start the container.
            Some(code @ 125..=127) => {
                warn!(
                    "Container runtime refused to run ({}): {}",
                    code,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                );
                Err(ExecutionError::tier_failure(format!(
                    "container runtime exited with {code}"
                )))
            }
            Some(code) => match parse_runner_output(&stdout) {
                Err(err @ (ExecutionError::Compile { .. } | ExecutionError::ScriptFailure { .. }))
                    if !stdout.trim().is_empty() =>
                {
                    Err(err)
                }
                _ => Err(ExecutionError::script(format!("container exited with status {code}"))),
            },
            None => Err(ExecutionError::resource("container killed by signal")),
        }
    }
}

/// Force-removes the container. [`ContainerGuard::teardown`] does it inline;
/// dropping an untorn guard schedules it on the runtime instead.
struct ContainerGuard {
    runtime: String,
    name: String,
    limit: Duration,
    done: bool,
}

impl ContainerGuard {
    fn new(config: &ContainerConfig, name: String) -> Self {
        Self {
            runtime: config.runtime.clone(),
            name,
            limit: Duration::from_secs(config.teardown_timeout_secs),
            done: false,
        }
    }

    async fn teardown(mut self) {
        self.done = true;
        remove_container(&self.runtime, &self.name, self.limit).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let (runtime, name, limit) = (self.runtime.clone(), self.name.clone(), self.limit);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_container(&runtime, &name, limit).await });
            }
            Err(_) => warn!("No runtime to remove container {}", self.name),
        }
    }
}

async fn remove_container(runtime: &str, name: &str, limit: Duration) {
    let mut command = Command::new(runtime);
    command
        .args(["rm", "-f", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match timeout(limit, command.status()).await {
        Ok(Ok(_)) => debug!("Container {} removed", name),
        Ok(Err(e)) => warn!("Failed to remove container {}: {}", name, e),
        Err(_) => warn!("Timed out removing container {}", name),
    }
}

/// The container user is not the owner of the staged files.
#[cfg(unix)]
fn make_readable(dir: &Path) -> std::io::Result<()> {
    use std::fs::{set_permissions, Permissions};
    use std::os::unix::fs::PermissionsExt;

    set_permissions(dir, Permissions::from_mode(0o755))?;
    for file in ["script.py", "input.json", "runner.py"] {
        set_permissions(dir.join(file), Permissions::from_mode(0o644))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_readable(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Interprets the runner's last JSON line.
fn parse_runner_output(stdout: &str) -> Result<Value, ExecutionError> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ExecutionError::script("script produced no result"))?;
    let reply: Value = serde_json::from_str(line)
        .map_err(|_| ExecutionError::script("script produced malformed output"))?;

    if reply.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(reply.get("value").cloned().unwrap_or(Value::Null));
    }
    let message = reply
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    match reply.get("kind").and_then(Value::as_str) {
        Some("compile") => Err(ExecutionError::Compile {
            line: reply
                .get("line")
                .and_then(Value::as_u64)
                .and_then(|l| usize::try_from(l).ok()),
            message,
        }),
        _ => Err(ExecutionError::script(message)),
    }
}
