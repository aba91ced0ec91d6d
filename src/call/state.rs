//! Call lifecycle states, call records and the transition function.
//!
//! Forward states only move forward, `Speaking` and `Listening` cycle freely
//! for multi-turn conversation, and terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    // Forward states
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    // Terminal states
    Completed,
    HangupUser,
    HangupBot,
    Timeout,
    Error,
}

/// Strictly ordered forward sequence.
const STATE_ORDER: [CallState; 6] = [
    CallState::Initiated,
    CallState::Ringing,
    CallState::Answered,
    CallState::Active,
    CallState::Speaking,
    CallState::Listening,
];

impl CallState {
    pub const ALL: [CallState; 11] = [
        CallState::Initiated,
        CallState::Ringing,
        CallState::Answered,
        CallState::Active,
        CallState::Speaking,
        CallState::Listening,
        CallState::Completed,
        CallState::HangupUser,
        CallState::HangupBot,
        CallState::Timeout,
        CallState::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::HangupUser
                | CallState::HangupBot
                | CallState::Timeout
                | CallState::Error
        )
    }

    /// Member of the speaking/listening pair that may cycle.
    pub fn is_conversational(self) -> bool {
        matches!(self, CallState::Speaking | CallState::Listening)
    }

    /// Position in the forward sequence, `None` for terminal states.
    pub fn forward_index(self) -> Option<usize> {
        STATE_ORDER.iter().position(|s| *s == self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Initiated => "initiated",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Active => "active",
            CallState::Speaking => "speaking",
            CallState::Listening => "listening",
            CallState::Completed => "completed",
            CallState::HangupUser => "hangup-user",
            CallState::HangupBot => "hangup-bot",
            CallState::Timeout => "timeout",
            CallState::Error => "error",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Bot,
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
}

/// Record of a single call.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: String,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<CallState>,
    pub transcript: Vec<TranscriptEntry>,
}

impl CallRecord {
    pub fn new() -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            state: CallState::Initiated,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            transcript: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time from answer (or start, if never answered) until end (or now).
    pub fn duration(&self) -> chrono::Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        let start = self.answered_at.unwrap_or(self.started_at);
        end - start
    }

    pub fn add_transcript(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            speaker,
            text: text.into(),
        });
    }
}

impl Default for CallRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Attempt to move `call` into `target`. Returns `true` if the state changed.
///
/// Never fails loudly: a rejected request leaves the record untouched and
/// returns `false`.
pub fn transition_state(call: &mut CallRecord, target: CallState) -> bool {
    if call.state == target || call.is_terminal() {
        return false;
    }

    if target.is_terminal() {
        call.state = target;
        call.ended_at = Some(Utc::now());
        call.end_reason = Some(target);
        return true;
    }

    if call.state.is_conversational() && target.is_conversational() {
        call.state = target;
        return true;
    }

    let (Some(current_idx), Some(target_idx)) = (call.state.forward_index(), target.forward_index())
    else {
        return false;
    };

    if target_idx > current_idx {
        call.state = target;
        if target == CallState::Answered {
            call.answered_at = Some(Utc::now());
        }
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_in(state: CallState) -> CallRecord {
        let mut record = CallRecord::new();
        record.state = state;
        record
    }

    #[test]
    fn test_terminal_state_rejects_everything() {
        for terminal in CallState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for target in CallState::ALL {
                let mut record = record_in(terminal);
                assert!(!transition_state(&mut record, target));
                assert_eq!(record.state, terminal);
                assert!(record.ended_at.is_none());
            }
        }
    }

    #[test]
    fn test_same_state_is_noop() {
        for state in CallState::ALL {
            let mut record = record_in(state);
            assert!(!transition_state(&mut record, state));
        }
    }

    #[test]
    fn test_forward_order_rule() {
        for from in STATE_ORDER {
            for to in STATE_ORDER {
                if from == to || (from.is_conversational() && to.is_conversational()) {
                    continue;
                }
                let mut record = record_in(from);
                let expected = to.forward_index() > from.forward_index();
                assert_eq!(
                    transition_state(&mut record, to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
                assert_eq!(record.state, if expected { to } else { from });
            }
        }
    }

    #[test]
    fn test_speaking_listening_cycle() {
        let mut record = record_in(CallState::Speaking);
        for _ in 0..3 {
            assert!(transition_state(&mut record, CallState::Listening));
            assert!(transition_state(&mut record, CallState::Speaking));
        }
        assert!(record.answered_at.is_none());
        assert!(record.ended_at.is_none());
    }

    #[test]
    fn test_answered_stamped_once() {
        let mut record = CallRecord::new();
        assert!(transition_state(&mut record, CallState::Ringing));
        assert!(transition_state(&mut record, CallState::Answered));
        let first = record.answered_at;
        assert!(first.is_some());

        assert!(!transition_state(&mut record, CallState::Answered));
        assert_eq!(record.answered_at, first);
    }

    #[test]
    fn test_terminal_stamps_once() {
        let mut record = record_in(CallState::Listening);
        assert!(transition_state(&mut record, CallState::HangupUser));
        let ended = record.ended_at;
        assert!(ended.is_some());
        assert_eq!(record.end_reason, Some(CallState::HangupUser));

        assert!(!transition_state(&mut record, CallState::Error));
        assert_eq!(record.state, CallState::HangupUser);
        assert_eq!(record.ended_at, ended);
        assert_eq!(record.end_reason, Some(CallState::HangupUser));
    }

    #[test]
    fn test_terminal_reachable_from_initiated() {
        let mut record = CallRecord::new();
        assert!(transition_state(&mut record, CallState::Timeout));
        assert_eq!(record.end_reason, Some(CallState::Timeout));
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CallState::HangupUser).unwrap(),
            "\"hangup-user\""
        );
        assert_eq!(CallState::HangupBot.to_string(), "hangup-bot");
    }

    #[test]
    fn test_transcript_is_ordered() {
        let mut record = CallRecord::new();
        record.add_transcript(Speaker::Bot, "Good morning.");
        record.add_transcript(Speaker::User, "hello");
        assert_eq!(record.transcript.len(), 2);
        assert_eq!(record.transcript[0].speaker, Speaker::Bot);
        assert!(record.transcript[0].timestamp <= record.transcript[1].timestamp);
    }
}
