//! Call lifecycle: records, the transition function, the single-call manager
//! and its max-duration watchdog.

pub mod manager;
pub mod state;
pub mod watchdog;

pub use manager::{CallManager, CallSession, TimeoutCallback};
pub use state::{transition_state, CallRecord, CallState, Speaker, TranscriptEntry};
pub use watchdog::DurationWatchdog;
