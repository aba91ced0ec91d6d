//! Single-active-call manager with the max-duration safety timer.
//!
//! `CallManager` is a cheap, cloneable handle. The connection handler and the
//! watchdog task share it; the slot lock is never held across an await.

use crate::call::state::{transition_state, CallRecord, CallState, Speaker, TranscriptEntry};
use crate::call::watchdog::DurationWatchdog;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Invoked with the call id after the watchdog forced a `Timeout`.
pub type TimeoutCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Slot {
    active: Option<CallRecord>,
    watchdog: Option<DurationWatchdog>,
    on_timeout: Option<TimeoutCallback>,
    last_ended: Option<CallRecord>,
}

impl Slot {
    fn cancel_watchdog(&mut self) {
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.cancel_watchdog();
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns at most one active call and its watchdog.
#[derive(Clone)]
pub struct CallManager {
    slot: Arc<Mutex<Slot>>,
    max_duration: Duration,
}

impl CallManager {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            max_duration,
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Snapshot of the active call.
    pub fn active_call(&self) -> Option<CallRecord> {
        lock(&self.slot).active.clone()
    }

    /// The most recently ended call, kept for inspection after it was detached.
    pub fn last_ended(&self) -> Option<CallRecord> {
        lock(&self.slot).last_ended.clone()
    }

    /// Whether a watchdog timer is currently running.
    pub fn watchdog_armed(&self) -> bool {
        lock(&self.slot)
            .watchdog
            .as_ref()
            .is_some_and(DurationWatchdog::is_armed)
    }

    /// Start a new call. Ends any existing call first.
    pub fn start_call(&self) -> CallRecord {
        self.start_call_with(None)
    }

    /// Start a new call with a callback fired if the watchdog times it out.
    pub fn start_call_with(&self, on_timeout: Option<TimeoutCallback>) -> CallRecord {
        let mut slot = lock(&self.slot);

        if slot.active.as_ref().is_some_and(|c| !c.is_terminal()) {
            if let Some(previous) = self.end_locked(&mut *slot, CallState::HangupBot) {
                warn!(
                    "Call {}: replaced by a new call, ended as {}",
                    previous.call_id, previous.state
                );
            }
        }

        let call = CallRecord::new();
        info!("Call {}: started", call.call_id);
        slot.active = Some(call.clone());
        slot.on_timeout = on_timeout;
        call
    }

    /// Transition the active call. Returns `false` when nothing changed.
    pub fn transition(&self, target: CallState) -> bool {
        let mut slot = lock(&self.slot);
        self.transition_locked(&mut *slot, target)
    }

    /// End the active call, detach and return it.
    pub fn end_call(&self, reason: CallState) -> Option<CallRecord> {
        let mut slot = lock(&self.slot);
        self.end_locked(&mut *slot, reason)
    }

    /// Append to the active call's transcript; ignored once the call is over.
    pub fn add_transcript(&self, speaker: Speaker, text: &str) {
        let mut slot = lock(&self.slot);
        if let Some(call) = slot.active.as_mut().filter(|c| !c.is_terminal()) {
            call.add_transcript(speaker, text);
        }
    }

    /// Drop the active call without recording an end state and stop the timer.
    pub fn reset(&self) {
        let mut slot = lock(&self.slot);
        slot.cancel_watchdog();
        slot.active = None;
        slot.on_timeout = None;
    }

    /// Bind to the active call by id for the lifetime of one connection.
    pub fn session(&self, call_id: impl Into<String>) -> CallSession {
        CallSession {
            manager: self.clone(),
            call_id: call_id.into(),
        }
    }

    fn transition_locked(&self, slot: &mut Slot, target: CallState) -> bool {
        let Some(call) = slot.active.as_mut() else {
            return false;
        };

        let changed = transition_state(call, target);
        let call_id = call.call_id.clone();
        let terminal = call.is_terminal();

        if changed && target == CallState::Answered {
            slot.cancel_watchdog();
            slot.watchdog = Some(self.arm_watchdog(call_id));
        }
        if changed && terminal {
            slot.cancel_watchdog();
        }
        changed
    }

    fn end_locked(&self, slot: &mut Slot, reason: CallState) -> Option<CallRecord> {
        slot.active.as_ref()?;
        self.transition_locked(slot, reason);
        slot.cancel_watchdog();
        slot.on_timeout = None;
        let call = slot.active.take();
        slot.last_ended = call.clone();
        call
    }

    fn arm_watchdog(&self, call_id: String) -> DurationWatchdog {
        let slot = Arc::downgrade(&self.slot);
        let expired_id = call_id.clone();
        DurationWatchdog::arm(call_id, self.max_duration, move || {
            expire(slot, &expired_id);
        })
    }

    fn with_call<T>(&self, call_id: &str, f: impl FnOnce(&mut Slot) -> T) -> Option<T> {
        let mut slot = lock(&self.slot);
        let matches = slot.active.as_ref().is_some_and(|c| c.call_id == call_id);
        matches.then(|| f(&mut *slot))
    }
}

/// Watchdog expiry: force `Timeout` if the call is still the live one.
fn expire(slot: Weak<Mutex<Slot>>, call_id: &str) {
    let Some(slot) = slot.upgrade() else {
        return;
    };

    let callback = {
        let mut guard = lock(&slot);
        let Some(call) = guard
            .active
            .as_mut()
            .filter(|c| c.call_id == call_id && !c.is_terminal())
        else {
            return;
        };
        if !transition_state(call, CallState::Timeout) {
            return;
        }
        warn!("Call {}: max duration reached, timing out", call_id);
        // Detach our own handle without aborting the running task.
        if guard
            .watchdog
            .as_ref()
            .is_some_and(|w| w.call_id() == call_id)
        {
            guard.watchdog = None;
        }
        guard.on_timeout.clone()
    };

    if let Some(callback) = callback {
        callback(call_id);
    }
}

/// A connection's view of its own call.
///
/// Every operation is a no-op once the manager has moved on to another call,
/// so a replaced connection can never touch the newer call.
#[derive(Clone)]
pub struct CallSession {
    manager: CallManager,
    call_id: String,
}

impl CallSession {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// True while this session's call is still the manager's active call.
    pub fn is_current(&self) -> bool {
        self.manager.with_call(&self.call_id, |_| ()).is_some()
    }

    /// True once the call reached a terminal state or was replaced.
    pub fn is_over(&self) -> bool {
        self.manager
            .with_call(&self.call_id, |slot| {
                slot.active.as_ref().is_some_and(CallRecord::is_terminal)
            })
            .unwrap_or(true)
    }

    pub fn transition(&self, target: CallState) -> bool {
        let manager = &self.manager;
        manager
            .with_call(&self.call_id, |slot| manager.transition_locked(slot, target))
            .unwrap_or(false)
    }

    pub fn add_transcript(&self, speaker: Speaker, text: &str) -> bool {
        self.manager
            .with_call(&self.call_id, |slot| {
                match slot.active.as_mut().filter(|c| !c.is_terminal()) {
                    Some(call) => {
                        call.add_transcript(speaker, text);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false)
    }

    /// Transcript entries so far, oldest first.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.record().map(|c| c.transcript).unwrap_or_default()
    }

    pub fn record(&self) -> Option<CallRecord> {
        self.manager
            .with_call(&self.call_id, |slot| slot.active.clone())
            .flatten()
    }

    /// End this call if it is still the active one.
    pub fn end(&self, reason: CallState) -> Option<CallRecord> {
        let manager = &self.manager;
        manager
            .with_call(&self.call_id, |slot| manager.end_locked(slot, reason))
            .flatten()
    }
}
