//! Utterance segmentation
//!
//! Accumulates inbound PCM into utterances from the per-chunk VAD signal and
//! measures the pauses inside each one. Time is passed in by the caller so the
//! gap accounting can be driven deterministically.

use crate::audio::pcm_duration_secs;
use crate::vad::VadState;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Pause statistics for one finalized utterance, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SilenceReport {
    /// Longest pause inside the utterance.
    pub max_gap: f64,
    pub gap_count: usize,
    pub audio_duration: f64,
    /// The trailing pause that ended the utterance.
    pub final_silence: f64,
}

/// A finalized span of caller speech.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// 16-bit little-endian mono PCM.
    pub audio: Vec<u8>,
    pub report: SilenceReport,
}

impl Utterance {
    pub fn duration_secs(&self) -> f64 {
        self.report.audio_duration
    }
}

/// Per-call speech buffer and silence-gap tracker.
#[derive(Debug)]
pub struct Segmenter {
    sample_rate: u32,
    speech_buffer: Vec<u8>,
    is_speaking: bool,
    silence_gaps: Vec<Duration>,
    silence_start: Option<Instant>,
    prev_state: VadState,
}

impl Segmenter {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            speech_buffer: Vec::new(),
            is_speaking: false,
            silence_gaps: Vec::new(),
            silence_start: None,
            prev_state: VadState::Quiet,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    /// Bytes buffered for the utterance in progress.
    pub fn buffered(&self) -> usize {
        self.speech_buffer.len()
    }

    /// Discard any utterance in progress.
    pub fn reset(&mut self) {
        self.speech_buffer.clear();
        self.is_speaking = false;
        self.silence_gaps.clear();
        self.silence_start = None;
        self.prev_state = VadState::Quiet;
    }

    /// Feed one chunk with the VAD state computed for it.
    ///
    /// Returns the utterance once the VAD reports `Quiet` after speech.
    pub fn push(&mut self, chunk: &[u8], vad_state: VadState, now: Instant) -> Option<Utterance> {
        if self.prev_state.is_speech() && vad_state == VadState::Stopping {
            self.silence_start.get_or_insert(now);
        }
        if vad_state.is_speech() {
            if let Some(start) = self.silence_start.take() {
                self.silence_gaps.push(now.saturating_duration_since(start));
            }
        }
        self.prev_state = vad_state;

        match vad_state {
            VadState::Starting | VadState::Speaking => {
                if !self.is_speaking {
                    self.speech_buffer.clear();
                    self.silence_gaps.clear();
                    self.is_speaking = true;
                }
                self.speech_buffer.extend_from_slice(chunk);
                None
            }
            VadState::Stopping => {
                if self.is_speaking {
                    self.speech_buffer.extend_from_slice(chunk);
                }
                None
            }
            VadState::Quiet if self.is_speaking => {
                self.speech_buffer.extend_from_slice(chunk);
                Some(self.finalize(now))
            }
            VadState::Quiet => None,
        }
    }

    fn finalize(&mut self, now: Instant) -> Utterance {
        self.is_speaking = false;
        let audio = std::mem::take(&mut self.speech_buffer);
        let gaps = std::mem::take(&mut self.silence_gaps);
        let final_silence = self
            .silence_start
            .take()
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();

        let report = SilenceReport {
            max_gap: gaps.iter().max().copied().unwrap_or_default().as_secs_f64(),
            gap_count: gaps.len(),
            audio_duration: pcm_duration_secs(audio.len(), self.sample_rate),
            final_silence: final_silence.as_secs_f64(),
        };
        debug!(
            "Utterance finalized: {:.2}s audio, {} gaps, max gap {:.2}s",
            report.audio_duration, report.gap_count, report.max_gap
        );
        Utterance { audio, report }
    }
}
