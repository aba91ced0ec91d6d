//! External collaborators used by the turn pipeline.
//!
//! Each collaborator is a trait object so a call can run against HTTP
//! services, local engines or test doubles. Failures come back as
//! `ServiceError`; only `ServiceError::Fatal` is allowed to end a call.

pub mod forward;
pub mod llm;
pub mod stt;
pub mod tts;

pub use forward::WebhookForwarder;
pub use llm::{ChatCompletionsGateway, GatewayConfig};
pub use stt::{HttpStt, HttpSttConfig};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{CommandTts, HttpTts, HttpTtsConfig};

use crate::audio::AudioError;
use crate::call::{Speaker, TranscriptEntry};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;

/// Error type for collaborator calls
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Fatal service error: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether the call can no longer continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServiceError::Fatal(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            ServiceError::Unavailable(err.to_string())
        } else {
            ServiceError::InvalidResponse(err.to_string())
        }
    }
}

impl From<AudioError> for ServiceError {
    fn from(err: AudioError) -> Self {
        ServiceError::InvalidResponse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Lazily produced PCM chunks from a synthesizer.
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Speaker role in the language model context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextTurn {
    pub role: Role,
    #[serde(rename = "content")]
    pub text: String,
}

impl ContextTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

impl From<&TranscriptEntry> for ContextTurn {
    fn from(entry: &TranscriptEntry) -> Self {
        match entry.speaker {
            Speaker::User => ContextTurn::user(entry.text.clone()),
            Speaker::Bot => ContextTurn::assistant(entry.text.clone()),
        }
    }
}

/// Speech recognizer for one finalized utterance.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe 16-bit mono PCM. Empty text means nothing usable was heard.
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Response generator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce a reply for the given context, oldest turn first.
    async fn complete(&self, context: &[ContextTurn]) -> Result<String>;
}

/// Speech synthesizer.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Start synthesizing `text`; chunks are 16-bit mono PCM at the call rate.
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// Out-of-band delivery for long responses.
#[async_trait]
pub trait SideChannel: Send + Sync {
    async fn forward(&self, call_id: &str, text: &str) -> Result<()>;
}

/// The collaborator set shared by every call.
#[derive(Clone)]
pub struct Services {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
    pub side_channel: Option<Arc<dyn SideChannel>>,
}
