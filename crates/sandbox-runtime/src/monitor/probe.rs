//! Process resource sampling.
//!
//! A sample covers a [`SampleScope`]: the whole process, or only the worker
//! thread one execution runs on. Concurrent executions share the process, so
//! each is charged only for its own scope.

use std::fs;

use parking_lot::Mutex;
use thiserror::Error;

/// Point-in-time resource usage of the sandbox process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_seconds: f64,
    pub threads: u64,
    pub open_fds: u64,
    pub children: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Resource probe unavailable: {message}")]
    Unavailable { message: String },

    #[error("Could not parse {source_name}: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },
}

impl ProbeError {
    fn parse<S: Into<String>>(source_name: &'static str, message: S) -> Self {
        Self::Parse {
            source_name,
            message: message.into(),
        }
    }
}

/// What a sample covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleScope {
    Process,
    /// One worker thread, by kernel thread id. Memory, threads and open files
    /// are shared with the rest of the process and read as zero; the engine's
    /// own allocation budget covers memory.
    Thread(i32),
}

impl SampleScope {
    /// The calling thread on Linux, the whole process elsewhere.
    pub fn current_thread() -> Self {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: gettid has no preconditions and cannot fail.
            let tid = unsafe { libc::syscall(libc::SYS_gettid) };
            if let Ok(tid) = i32::try_from(tid) {
                return SampleScope::Thread(tid);
            }
        }
        SampleScope::Process
    }
}

/// Where an execution's work runs, filled in by the tier once it starts.
/// Empty while queued, and for tiers that enforce limits outside this
/// process.
#[derive(Debug, Default)]
pub struct WorkerScope {
    slot: Mutex<Option<SampleScope>>,
}

impl WorkerScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assigned(scope: SampleScope) -> Self {
        Self {
            slot: Mutex::new(Some(scope)),
        }
    }

    pub fn assign(&self, scope: SampleScope) {
        *self.slot.lock() = Some(scope);
    }

    pub fn current(&self) -> Option<SampleScope> {
        *self.slot.lock()
    }
}

/// Source of resource samples. The monitor calls it from a tokio task every
/// sampling interval, so implementations must be cheap and non-blocking in
/// practice.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSample, ProbeError>;

    /// Usage of `scope` only. Probes without finer sources report the
    /// process.
    fn sample_scope(&self, scope: SampleScope) -> Result<ResourceSample, ProbeError> {
        let _ = scope;
        self.sample()
    }

    /// 1-minute load average, when the platform exposes one.
    fn load_average(&self) -> Option<f64> {
        None
    }
}

/// Reads `/proc/self`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFsProbe;

impl ProcFsProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl ResourceProbe for ProcFsProbe {
    fn sample(&self) -> Result<ResourceSample, ProbeError> {
        let status = read("/proc/self/status")?;
        let stat = read("/proc/self/stat")?;
        let (rss_bytes, virtual_bytes, threads) = parse_status(&status)?;
        let cpu_seconds = parse_cpu_seconds(&stat, clock_ticks())?;
        let open_fds = fs::read_dir("/proc/self/fd")
            .map(|entries| entries.count() as u64)
            .map_err(|e| ProbeError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(ResourceSample {
            rss_bytes,
            virtual_bytes,
            cpu_seconds,
            threads,
            open_fds,
            children: count_children(),
        })
    }

    fn sample_scope(&self, scope: SampleScope) -> Result<ResourceSample, ProbeError> {
        match scope {
            SampleScope::Process => self.sample(),
            SampleScope::Thread(tid) => sample_thread(tid),
        }
    }

    fn load_average(&self) -> Option<f64> {
        fs::read_to_string("/proc/loadavg")
            .ok()?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }
}

#[cfg(not(target_os = "linux"))]
impl ResourceProbe for ProcFsProbe {
    fn sample(&self) -> Result<ResourceSample, ProbeError> {
        Err(ProbeError::Unavailable {
            message: "procfs is only available on Linux".to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
fn read(path: &str) -> Result<String, ProbeError> {
    fs::read_to_string(path).map_err(|e| ProbeError::Unavailable {
        message: format!("{path}: {e}"),
    })
}

/// CPU time and children of one task of this process.
#[cfg(target_os = "linux")]
fn sample_thread(tid: i32) -> Result<ResourceSample, ProbeError> {
    let task = format!("/proc/self/task/{tid}");
    let stat = read(&format!("{task}/stat"))?;
    let children = fs::read_to_string(format!("{task}/children"))
        .map(|children| children.split_whitespace().count() as u64)
        .unwrap_or(0);
    Ok(ResourceSample {
        cpu_seconds: parse_cpu_seconds(&stat, clock_ticks())?,
        threads: 1,
        children,
        ..ResourceSample::default()
    })
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Children of every thread of this process.
#[cfg(target_os = "linux")]
fn count_children() -> u64 {
    let Ok(tasks) = fs::read_dir("/proc/self/task") else {
        return 0;
    };
    tasks
        .filter_map(Result::ok)
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .map(|children| children.split_whitespace().count() as u64)
        .sum()
}

/// `(VmRSS, VmSize, Threads)` from `/proc/<pid>/status`, sizes in bytes.
pub(crate) fn parse_status(status: &str) -> Result<(u64, u64, u64), ProbeError> {
    let mut rss = None;
    let mut size = None;
    let mut threads = None;
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let first = value.split_whitespace().next();
        let number = || {
            first
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| ProbeError::parse("status", format!("bad {key} value")))
        };
        match key {
            "VmRSS" => rss = Some(number()? * 1024),
            "VmSize" => size = Some(number()? * 1024),
            "Threads" => threads = Some(number()?),
            _ => {}
        }
    }
    Ok((
        rss.ok_or_else(|| ProbeError::parse("status", "missing VmRSS"))?,
        size.unwrap_or(0),
        threads.ok_or_else(|| ProbeError::parse("status", "missing Threads"))?,
    ))
}

/// User plus system CPU time from `/proc/<pid>/stat`.
pub(crate) fn parse_cpu_seconds(stat: &str, ticks_per_second: f64) -> Result<f64, ProbeError> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last `)`, starting at field 3 (state).
    let rest = stat
        .rfind(')')
        .map(|idx| &stat[idx + 1..])
        .ok_or_else(|| ProbeError::parse("stat", "missing command terminator"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |n: usize| -> Result<f64, ProbeError> {
        fields
            .get(n - 3)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| ProbeError::parse("stat", format!("missing field {n}")))
    };
    Ok((field(14)? + field(15)?) / ticks_per_second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status() {
        let status = "Name:\tsandbox\nVmSize:\t  204800 kB\nVmRSS:\t   10240 kB\nThreads:\t7\n";
        assert_eq!(
            parse_status(status).unwrap(),
            (10240 * 1024, 204800 * 1024, 7)
        );
        assert!(parse_status("Name:\tx\n").is_err());
    }

    #[test]
    fn parses_stat_with_awkward_command_name() {
        let stat = "1234 (a) b (c)) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 7 0";
        assert_eq!(parse_cpu_seconds(stat, 100.0).unwrap(), 3.0);
        assert!(parse_cpu_seconds("garbage", 100.0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thread_scope_counts_only_that_thread() {
        let probe = ProcFsProbe::new();
        let scope = SampleScope::current_thread();
        assert!(matches!(scope, SampleScope::Thread(_)));

        // Another thread burning CPU is not charged to this one.
        let busy = std::thread::spawn(|| {
            let started = std::time::Instant::now();
            let mut x = 0u64;
            while started.elapsed() < std::time::Duration::from_millis(300) {
                x = std::hint::black_box(x.wrapping_add(1));
            }
            x
        });
        let before = probe.sample_scope(scope).unwrap();
        busy.join().unwrap();
        let after = probe.sample_scope(scope).unwrap();

        assert!(after.cpu_seconds - before.cpu_seconds < 0.2);
        assert_eq!(after.threads, 1);
        assert_eq!(after.rss_bytes, 0);
        assert_eq!(after.children, 0);
        assert!(probe.sample_scope(SampleScope::Process).unwrap().threads >= 1);
    }

    #[test]
    fn worker_scope_starts_empty() {
        let scope = WorkerScope::new();
        assert_eq!(scope.current(), None);
        scope.assign(SampleScope::Thread(7));
        assert_eq!(scope.current(), Some(SampleScope::Thread(7)));
        assert_eq!(WorkerScope::assigned(SampleScope::Process).current(), Some(SampleScope::Process));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_own_process() {
        let sample = ProcFsProbe::new().sample().unwrap();
        assert!(sample.rss_bytes > 0);
        assert!(sample.threads >= 1);
        assert!(sample.open_fds >= 1);
    }
}
