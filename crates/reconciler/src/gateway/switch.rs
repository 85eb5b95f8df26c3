//! Processing gate shared by every reconciler in the process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tracing::info;

use super::ProcessingGate;

/// On/off switch that counts in-flight passes so that [`ControllerSwitch::stop`]
/// can wait for them to drain.
#[derive(Debug)]
pub struct ControllerSwitch {
    running: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Default for ControllerSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerSwitch {
    /// Create an enabled switch.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Whether processing is enabled.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Passes currently between `enter` and `exit`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Re-enable processing.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Constraint controllers enabled");
    }

    /// Disable processing and wait until every pass that entered while the
    /// switch was on has exited.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                break;
            }
            idle.await;
        }
        info!("Constraint controllers disabled");
    }
}

impl ProcessingGate for ControllerSwitch {
    fn enter(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.is_running()
    }

    fn exit(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Holds a gate registration for the duration of one pass and releases it
/// on drop.
pub struct GateGuard<'a> {
    gate: &'a dyn ProcessingGate,
    enabled: bool,
}

impl<'a> GateGuard<'a> {
    /// Enter `gate`.
    pub fn enter(gate: &'a dyn ProcessingGate) -> Self {
        let enabled = gate.enter();
        Self { gate, enabled }
    }

    /// Whether processing was enabled on entry.
    pub const fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}
