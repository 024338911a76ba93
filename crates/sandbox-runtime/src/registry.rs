//! Registry of in-flight executions.
//!
//! Entries live from slot acquisition to slot release. The registry enforces
//! its own hard ceiling, so a bug in admission can never let more than
//! `max_active` executions run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::limits::ResourceLimits;
use crate::request::{ExecutionId, ScriptRef};
use crate::tier::TierKind;

#[derive(Debug, Clone)]
pub struct ActiveExecution {
    pub execution_id: ExecutionId,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub limits: ResourceLimits,
    pub tier: TierKind,
    pub user_id: String,
    pub script_ref: ScriptRef,
    pub cancel: CancellationToken,
}

impl ActiveExecution {
    pub fn new(
        execution_id: ExecutionId,
        limits: ResourceLimits,
        tier: TierKind,
        user_id: impl Into<String>,
        script_ref: ScriptRef,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            limits,
            tier,
            user_id: user_id.into(),
            script_ref,
            cancel,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Serializable view of an entry for health and status output.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSummary {
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u128,
    pub tier: TierKind,
    pub user_id: String,
    pub script_ref: ScriptRef,
}

#[derive(Debug)]
pub struct ExecutionRegistry {
    max_active: usize,
    entries: Mutex<HashMap<ExecutionId, ActiveExecution>>,
}

impl ExecutionRegistry {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Inserts `entry`; the returned lease removes it again on drop.
    pub fn register(self: &Arc<Self>, entry: ActiveExecution) -> Result<ActiveLease, ExecutionError> {
        let execution_id = entry.execution_id;
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_active {
            warn!(
                active = entries.len(),
                limit = self.max_active,
                "execution registry at hard ceiling"
            );
            return Err(ExecutionError::ConcurrencyExceeded {
                limit: self.max_active,
            });
        }
        entries.insert(execution_id, entry);
        debug!(%execution_id, active = entries.len(), "execution registered");
        Ok(ActiveLease {
            registry: Arc::clone(self),
            execution_id,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, execution_id: &ExecutionId) -> bool {
        self.entries.lock().contains_key(execution_id)
    }

    pub fn snapshot(&self) -> Vec<ActiveSummary> {
        let mut summaries: Vec<ActiveSummary> = self
            .entries
            .lock()
            .values()
            .map(|entry| ActiveSummary {
                execution_id: entry.execution_id,
                started_at: entry.started_wall,
                elapsed_ms: entry.elapsed().as_millis(),
                tier: entry.tier,
                user_id: entry.user_id.clone(),
                script_ref: entry.script_ref.clone(),
            })
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Cancels every active execution's token. Returns how many were
    /// cancelled now; already-cancelled tokens are not counted.
    pub fn cancel_all(&self) -> usize {
        let entries = self.entries.lock();
        let mut cancelled = 0;
        for entry in entries.values().filter(|entry| !entry.cancel.is_cancelled()) {
            entry.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    fn release(&self, execution_id: &ExecutionId) {
        let mut entries = self.entries.lock();
        if entries.remove(execution_id).is_some() {
            debug!(%execution_id, active = entries.len(), "execution released");
        }
    }
}

/// Removes its registry entry when dropped.
#[derive(Debug)]
pub struct ActiveLease {
    registry: Arc<ExecutionRegistry>,
    execution_id: ExecutionId,
}

impl ActiveLease {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.registry.release(&self.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ActiveExecution {
        ActiveExecution::new(
            ExecutionId::new(),
            ResourceLimits::default(),
            TierKind::Rlimit,
            "alice",
            ScriptRef::new("alice/s.py"),
            CancellationToken::new(),
        )
    }

    #[test]
    fn lease_releases_entry() {
        let registry = Arc::new(ExecutionRegistry::new(2));
        let e = entry();
        let id = e.execution_id;
        let lease = registry.register(e).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.snapshot()[0].user_id, "alice");
        drop(lease);
        assert!(registry.is_empty());
    }

    #[test]
    fn hard_ceiling_is_enforced() {
        let registry = Arc::new(ExecutionRegistry::new(2));
        let _a = registry.register(entry()).unwrap();
        let _b = registry.register(entry()).unwrap();
        assert_eq!(
            registry.register(entry()).unwrap_err(),
            ExecutionError::ConcurrencyExceeded { limit: 2 }
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn cancel_all_counts_newly_cancelled() {
        let registry = Arc::new(ExecutionRegistry::new(4));
        let first = entry();
        let token = first.cancel.clone();
        let _a = registry.register(first).unwrap();
        let _b = registry.register(entry()).unwrap();
        token.cancel();
        assert_eq!(registry.cancel_all(), 1);
        assert_eq!(registry.cancel_all(), 0);
    }
}
