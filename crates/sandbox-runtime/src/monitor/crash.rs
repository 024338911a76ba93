//! Crash prevention: the emergency stop and the signal handlers that pull it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Global stop flag with a reason and a watch channel for prompt wake-ups.
///
/// Once triggered it stays active until [`EmergencyStop::clear`] is called.
#[derive(Debug)]
pub struct EmergencyStop {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: watch::Sender<bool>,
}

impl Default for EmergencyStop {
    fn default() -> Self {
        Self::new()
    }
}

impl EmergencyStop {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            active: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify,
        }
    }

    /// Returns `true` if this call activated the stop.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut current = self.reason.lock();
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!("🛑 Emergency stop triggered: {}", reason);
        *current = Some(reason);
        self.notify.send_replace(true);
        true
    }

    pub fn clear(&self) {
        let mut current = self.reason.lock();
        if self.active.swap(false, Ordering::SeqCst) {
            info!("✅ Emergency stop cleared");
        }
        *current = None;
        self.notify.send_replace(false);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }
}

static SIGNAL_HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalInstall {
    Installed,
    AlreadyInstalled,
    NotMainThread,
}

/// Spawns a task that calls `on_signal` with a reason when SIGINT or SIGTERM
/// arrives. Installs at most once per process, and only from the thread
/// named `main`. Must be called inside a tokio runtime.
pub fn install_signal_handlers<F>(on_signal: F) -> SignalInstall
where
    F: Fn(String) + Send + Sync + 'static,
{
    if std::thread::current().name() != Some("main") {
        warn!("Signal handlers must be installed from the main thread; skipping");
        return SignalInstall::NotMainThread;
    }
    if SIGNAL_HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return SignalInstall::AlreadyInstalled;
    }

    let on_signal = Arc::new(on_signal);
    tokio::spawn(async move {
        loop {
            match wait_for_signal().await {
                Ok(name) => {
                    info!("📡 Received {}", name);
                    on_signal(format!("received {name}"));
                }
                Err(err) => {
                    error!("💥 Failed to listen for shutdown signals: {:?}", err);
                    break;
                }
            }
        }
    });
    SignalInstall::Installed
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl+C")
}
