//! Duplex call protocol.
//!
//! Binary frames carry 16-bit little-endian mono PCM in both directions.
//! Text frames carry JSON objects tagged by `type`.

use crate::segment::SilenceReport;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message of a connection.
    Connect {
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    Hangup,
    /// Trailing-silence threshold in seconds.
    VadStop { value: f32 },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse a text frame. Malformed JSON yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!("Ignoring malformed control message: {}", e);
                None
            }
        }
    }
}

/// Client-facing activity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiState {
    Ringing,
    Speaking,
    Listening,
    Transcribing,
    Thinking,
}

/// Control messages sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "callId")]
        call_id: String,
        greeting: String,
    },
    State {
        state: UiState,
    },
    Transcript {
        text: String,
        silence: SilenceReport,
    },
    ResponseText {
        text: String,
    },
    Done,
    VadUpdated {
        value: f32,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Transport-neutral inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// PCM stamped with its arrival time, so queued audio keeps its pauses.
    Audio { pcm: Vec<u8>, received: Instant },
    Control(ClientMessage),
    /// The peer closed the connection or the transport failed.
    Closed,
}

impl InboundFrame {
    /// Audio received now.
    pub fn audio(pcm: Vec<u8>) -> Self {
        InboundFrame::Audio {
            pcm,
            received: Instant::now(),
        }
    }
}

/// Transport-neutral outbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Audio(Vec<u8>),
    Control(ServerMessage),
}

impl From<ServerMessage> for OutboundFrame {
    fn from(msg: ServerMessage) -> Self {
        OutboundFrame::Control(msg)
    }
}
