//! Process-wide resource baseline, captured once at startup.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};

use super::probe::{ResourceProbe, ResourceSample};

static BASELINE: OnceCell<SystemBaseline> = OnceCell::new();

#[derive(Debug, Clone, Serialize)]
pub struct SystemBaseline {
    pub captured_at: DateTime<Utc>,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_seconds: f64,
    pub threads: u64,
    pub open_fds: u64,
    pub children: u64,
    pub load_average_1m: Option<f64>,
    pub cpu_count: usize,
}

impl SystemBaseline {
    fn from_sample(sample: ResourceSample, load_average_1m: Option<f64>) -> Self {
        Self {
            captured_at: Utc::now(),
            rss_bytes: sample.rss_bytes,
            virtual_bytes: sample.virtual_bytes,
            cpu_seconds: sample.cpu_seconds,
            threads: sample.threads,
            open_fds: sample.open_fds,
            children: sample.children,
            load_average_1m,
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// Captures the baseline on first call. Later calls return the first
/// capture regardless of `probe`. `None` if the first capture failed and no
/// later one has succeeded.
pub fn capture(probe: &dyn ResourceProbe) -> Option<&'static SystemBaseline> {
    if let Some(baseline) = BASELINE.get() {
        return Some(baseline);
    }
    match probe.sample() {
        Ok(sample) => {
            let baseline = BASELINE.get_or_init(|| SystemBaseline::from_sample(sample, probe.load_average()));
            info!(
                "📏 System baseline captured: rss={}KiB threads={} fds={} cpus={}",
                baseline.rss_bytes / 1024,
                baseline.threads,
                baseline.open_fds,
                baseline.cpu_count
            );
            Some(baseline)
        }
        Err(e) => {
            warn!("Could not capture system baseline: {}", e);
            None
        }
    }
}

pub fn baseline() -> Option<&'static SystemBaseline> {
    BASELINE.get()
}
