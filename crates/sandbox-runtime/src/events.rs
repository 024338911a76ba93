//! Sandbox events and the handler registry they are dispatched through.
//!
//! The registry is built once at startup. Every [`EventCategory`] must have
//! at least one handler, so no event is silently dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use threat_scanner::Severity;
use tracing::{info, warn};

use crate::monitor::BreakerState;
use crate::request::{ExecutionId, ScriptRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Granted,
    Denied,
}

/// One access-control decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub script_ref: ScriptRef,
    pub decision: AuditDecision,
    pub reason: String,
}

impl AuditEvent {
    pub fn new(
        user_id: impl Into<String>,
        script_ref: ScriptRef,
        decision: AuditDecision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.into(),
            script_ref,
            decision,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Audit(AuditEvent),
    ThreatBlocked {
        timestamp: DateTime<Utc>,
        execution_id: ExecutionId,
        user_id: String,
        script_ref: ScriptRef,
        max_severity: Option<Severity>,
        blocking_findings: usize,
    },
    Breach {
        timestamp: DateTime<Utc>,
        execution_id: ExecutionId,
        kind: String,
        detail: String,
    },
    EmergencyStop {
        timestamp: DateTime<Utc>,
        reason: String,
        cancelled: usize,
    },
    BreakerTransition {
        timestamp: DateTime<Utc>,
        breaker: String,
        from: BreakerState,
        to: BreakerState,
    },
}

impl SandboxEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            SandboxEvent::Audit(_) => EventCategory::Audit,
            SandboxEvent::ThreatBlocked { .. } => EventCategory::ThreatBlocked,
            SandboxEvent::Breach { .. } => EventCategory::Breach,
            SandboxEvent::EmergencyStop { .. } => EventCategory::EmergencyStop,
            SandboxEvent::BreakerTransition { .. } => EventCategory::BreakerTransition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Audit,
    ThreatBlocked,
    Breach,
    EmergencyStop,
    BreakerTransition,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Audit,
        EventCategory::ThreatBlocked,
        EventCategory::Breach,
        EventCategory::EmergencyStop,
        EventCategory::BreakerTransition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Audit => "audit",
            EventCategory::ThreatBlocked => "threat_blocked",
            EventCategory::Breach => "breach",
            EventCategory::EmergencyStop => "emergency_stop",
            EventCategory::BreakerTransition => "breaker_transition",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("No handler registered for event category `{category}`")]
    MissingHandler { category: EventCategory },
}

/// Receives dispatched events. Handlers must not block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &SandboxEvent);
}

/// Immutable category → handlers map.
#[derive(Clone)]
pub struct EventRegistry {
    handlers: HashMap<EventCategory, Vec<Arc<dyn EventHandler>>>,
}

impl EventRegistry {
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    /// Registry with a [`TracingSink`] on every category.
    pub fn tracing_only() -> Self {
        let sink: Arc<dyn EventHandler> = Arc::new(TracingSink);
        let handlers = EventCategory::ALL
            .into_iter()
            .map(|category| (category, vec![Arc::clone(&sink)]))
            .collect();
        Self { handlers }
    }

    /// Dispatches to every handler of the event's category, in registration order.
    pub fn emit(&self, event: SandboxEvent) {
        if let Some(handlers) = self.handlers.get(&event.category()) {
            for handler in handlers {
                handler.handle(&event);
            }
        }
    }

    pub fn handler_count(&self, category: EventCategory) -> usize {
        self.handlers.get(&category).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self
            .handlers
            .iter()
            .map(|(category, handlers)| (category.as_str(), handlers.len()))
            .collect();
        f.debug_struct("EventRegistry").field("handlers", &counts).finish()
    }
}

#[derive(Default)]
pub struct EventRegistryBuilder {
    handlers: HashMap<EventCategory, Vec<Arc<dyn EventHandler>>>,
}

impl EventRegistryBuilder {
    pub fn on(mut self, category: EventCategory, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.entry(category).or_default().push(handler);
        self
    }

    /// Registers `handler` for every category.
    pub fn on_all(mut self, handler: Arc<dyn EventHandler>) -> Self {
        for category in EventCategory::ALL {
            self = self.on(category, Arc::clone(&handler));
        }
        self
    }

    pub fn build(self) -> Result<EventRegistry, EventError> {
        if let Some(category) = EventCategory::ALL
            .into_iter()
            .find(|category| self.handlers.get(category).map_or(true, Vec::is_empty))
        {
            return Err(EventError::MissingHandler { category });
        }
        Ok(EventRegistry {
            handlers: self.handlers,
        })
    }
}

/// Logs every event under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventHandler for TracingSink {
    fn handle(&self, event: &SandboxEvent) {
        match event {
            SandboxEvent::Audit(audit) => match audit.decision {
                AuditDecision::Granted => info!(
                    target: "audit",
                    user_id = %audit.user_id,
                    script_ref = %audit.script_ref,
                    reason = %audit.reason,
                    "access granted"
                ),
                AuditDecision::Denied => warn!(
                    target: "audit",
                    user_id = %audit.user_id,
                    script_ref = %audit.script_ref,
                    reason = %audit.reason,
                    "access denied"
                ),
            },
            SandboxEvent::ThreatBlocked {
                execution_id,
                user_id,
                script_ref,
                max_severity,
                blocking_findings,
                ..
            } => warn!(
                target: "audit",
                %execution_id,
                %user_id,
                %script_ref,
                max_severity = ?max_severity,
                blocking_findings,
                "🛡️ script blocked by threat scan"
            ),
            SandboxEvent::Breach {
                execution_id,
                kind,
                detail,
                ..
            } => warn!(target: "audit", %execution_id, kind = %kind, detail = %detail, "resource breach"),
            SandboxEvent::EmergencyStop {
                reason, cancelled, ..
            } => warn!(target: "audit", reason = %reason, cancelled, "🛑 emergency stop"),
            SandboxEvent::BreakerTransition {
                breaker, from, to, ..
            } => info!(target: "audit", breaker = %breaker, from = ?from, to = ?to, "circuit breaker transition"),
        }
    }
}

/// Bounded in-memory retention of the most recent events.
#[derive(Debug)]
pub struct MemoryAuditLog {
    capacity: usize,
    events: Mutex<VecDeque<SandboxEvent>>,
}

impl MemoryAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn events(&self) -> Vec<SandboxEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SandboxEvent::Audit(audit) => Some(audit.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for MemoryAuditLog {
    fn handle(&self, event: &SandboxEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Forwards events to a bounded channel for an external transport.
///
/// Uses `try_send`: when the consumer falls behind, events are counted as
/// dropped instead of stalling the execution that produced them.
pub struct ChannelSink {
    sender: Sender<SandboxEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<SandboxEvent>) {
        let (sender, receiver) = bounded(capacity);
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventHandler for ChannelSink {
    fn handle(&self, event: &SandboxEvent) {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event channel full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSink")
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}
