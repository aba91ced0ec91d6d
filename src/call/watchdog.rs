//! Max-duration safety timer.
//!
//! One timer task per answered call. Cancelling is idempotent and safe after
//! the timer has already fired.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background timer that runs `on_expire` once the call has lasted too long.
#[derive(Debug)]
pub struct DurationWatchdog {
    call_id: String,
    handle: Option<JoinHandle<()>>,
}

impl DurationWatchdog {
    /// Arm a timer for `call_id` that runs `on_expire` after `after`.
    ///
    /// Returns a disarmed watchdog when called outside a tokio runtime.
    pub fn arm<F>(call_id: impl Into<String>, after: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let call_id = call_id.into();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Call {}: watchdog armed for {:?}", call_id, after);
                Some(runtime.spawn(async move {
                    tokio::time::sleep(after).await;
                    on_expire();
                }))
            }
            Err(_) => {
                warn!("Call {}: no async runtime, watchdog not armed", call_id);
                None
            }
        };
        Self { call_id, handle }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// True while the timer has neither fired nor been cancelled.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the timer. Calling this more than once, or after expiry, is a no-op.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!("Call {}: watchdog cancelled", self.call_id);
            }
            handle.abort();
        }
    }
}
