//! Voice activity detection.
//!
//! A detector turns each inbound PCM chunk into one of four states. The
//! frame-level speech decision is pluggable (`FrameClassifier`); the
//! onset/trailing-silence timing lives in `VadAnalyzer`.

pub mod analyzer;
pub mod energy;
pub mod webrtc;

pub use analyzer::{FrameClassifier, VadAnalyzer};
pub use energy::EnergyClassifier;
pub use webrtc::WebRtcClassifier;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lower bound for a runtime trailing-silence adjustment, in seconds.
pub const MIN_STOP_SECS: f32 = 0.5;
/// Upper bound for a runtime trailing-silence adjustment, in seconds.
pub const MAX_STOP_SECS: f32 = 15.0;

/// Error type for VAD construction
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("Unsupported sample rate for {engine} VAD: {rate} Hz")]
    UnsupportedSampleRate { engine: &'static str, rate: u32 },

    #[error("Unknown VAD engine: {0}")]
    UnknownEngine(String),
}

/// Per-chunk voice activity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadState {
    /// No speech.
    Quiet,
    /// Speech onset seen, not yet confirmed.
    Starting,
    /// Confirmed speech.
    Speaking,
    /// Trailing silence that has not yet lasted `stop_secs`.
    Stopping,
}

impl VadState {
    /// `Starting` or `Speaking`.
    pub fn is_speech(self) -> bool {
        matches!(self, VadState::Starting | VadState::Speaking)
    }
}

/// Timing and sensitivity parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadParams {
    /// Minimum frame confidence (0.0 to 1.0) to count a frame as speech.
    pub confidence: f32,
    /// Seconds of speech before `Starting` becomes `Speaking`.
    pub start_secs: f32,
    /// Seconds of trailing silence before `Stopping` becomes `Quiet`.
    pub stop_secs: f32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            confidence: 0.7,
            start_secs: 0.2,
            stop_secs: 0.8,
        }
    }
}

/// Clamp a requested trailing-silence threshold to the supported range.
pub fn clamp_stop_secs(secs: f32) -> f32 {
    if secs.is_nan() {
        return MIN_STOP_SECS;
    }
    secs.clamp(MIN_STOP_SECS, MAX_STOP_SECS)
}

/// Stateful, per-call voice activity detector.
pub trait VoiceActivityDetector: Send + Sync {
    /// Feed one chunk of 16-bit little-endian mono PCM.
    fn analyze(&mut self, chunk: &[u8]) -> VadState;

    fn params(&self) -> VadParams;

    /// Reconfigure the trailing-silence threshold. Returns the applied value.
    fn set_stop_secs(&mut self, secs: f32) -> f32;
}

/// Frame classifier backing a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadEngine {
    /// RMS energy threshold.
    #[default]
    Energy,
    /// WebRTC GMM voice detector.
    WebRtc,
}

impl FromStr for VadEngine {
    type Err = VadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "energy" | "rms" => Ok(VadEngine::Energy),
            "webrtc" => Ok(VadEngine::WebRtc),
            other => Err(VadError::UnknownEngine(other.to_string())),
        }
    }
}

/// Build a fresh detector for one call.
pub fn build_detector(
    engine: VadEngine,
    params: VadParams,
    energy_threshold: f32,
    sample_rate: u32,
) -> Result<Box<dyn VoiceActivityDetector>, VadError> {
    match engine {
        VadEngine::Energy => {
            let classifier = EnergyClassifier::new(energy_threshold, sample_rate);
            Ok(Box::new(VadAnalyzer::new(classifier, sample_rate, params)))
        }
        VadEngine::WebRtc => {
            let classifier = WebRtcClassifier::new(sample_rate)?;
            Ok(Box::new(VadAnalyzer::new(classifier, sample_rate, params)))
        }
    }
}
