//! Circuit breaker guarding the sandbox machinery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::events::{EventRegistry, SandboxEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,   // Normal operation
    Open,     // Failing fast
    HalfOpen, // Probing for recovery
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    next_retry: Option<DateTime<Utc>>,
}

/// Closed → Open after `failure_threshold` consecutive failures; Open →
/// HalfOpen on the first request after `recovery_timeout`; HalfOpen →
/// Closed after `half_open_successes` consecutive successes, or back to Open
/// on any failure.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_successes: u32,
    inner: Mutex<BreakerInner>,
    events: Option<Arc<EventRegistry>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_successes: config.half_open_successes.max(1),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                half_open_successes: 0,
                opened_at: None,
                last_failure: None,
                next_retry: None,
            }),
            events: None,
        }
    }

    /// Transitions are emitted as [`SandboxEvent::BreakerTransition`].
    pub fn with_events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure: inner.last_failure,
            next_retry: inner.next_retry,
        }
    }

    /// Whether a guarded call may proceed now.
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|opened| now.saturating_duration_since(opened) >= self.recovery_timeout);
                if recovered {
                    inner.half_open_successes = 0;
                    self.transition(&mut inner, BreakerState::HalfOpen);
                }
                recovered
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_successes {
                    inner.failure_count = 0;
                    inner.opened_at = None;
                    inner.next_retry = None;
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Utc::now());
        let trip = match inner.state {
            BreakerState::Closed => inner.failure_count >= self.failure_threshold,
            BreakerState::HalfOpen => true,
            BreakerState::Open => false,
        };
        if trip {
            inner.opened_at = Some(now);
            inner.next_retry = chrono::Duration::from_std(self.recovery_timeout)
                .ok()
                .map(|timeout| Utc::now() + timeout);
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    /// Back to Closed with counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        inner.next_retry = None;
        self.transition(&mut inner, BreakerState::Closed);
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "⚡ circuit breaker opened"
            ),
            _ => info!(breaker = %self.name, ?from, ?to, "circuit breaker transition"),
        }
        if let Some(events) = &self.events {
            events.emit(SandboxEvent::BreakerTransition {
                timestamp: Utc::now(),
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
