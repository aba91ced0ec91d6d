//! Frame-based QUIET → STARTING → SPEAKING → STOPPING state machine.

use super::{clamp_stop_secs, VadParams, VadState, VoiceActivityDetector};
use crate::audio::u8_to_i16_slice;
use tracing::debug;

/// Scores one fixed-size frame of audio.
pub trait FrameClassifier: Send + Sync {
    /// Samples per frame.
    fn frame_len(&self) -> usize;

    /// Confidence (0.0 to 1.0) that the frame contains speech.
    fn voice_confidence(&mut self, frame: &[i16]) -> f32;
}

/// Voice activity detector driving a `FrameClassifier` frame by frame.
///
/// Partial frames are carried over to the next chunk, so chunk sizes from the
/// transport do not need to line up with the classifier's frame size.
pub struct VadAnalyzer<C: FrameClassifier> {
    classifier: C,
    params: VadParams,
    frame_secs: f32,
    start_frames: u32,
    stop_frames: u32,
    state: VadState,
    starting_count: u32,
    stopping_count: u32,
    pending: Vec<u8>,
}

fn frames_for(secs: f32, frame_secs: f32) -> u32 {
    ((secs / frame_secs).round() as u32).max(1)
}

impl<C: FrameClassifier> VadAnalyzer<C> {
    pub fn new(classifier: C, sample_rate: u32, params: VadParams) -> Self {
        let frame_secs = classifier.frame_len() as f32 / sample_rate.max(1) as f32;
        Self {
            start_frames: frames_for(params.start_secs, frame_secs),
            stop_frames: frames_for(params.stop_secs, frame_secs),
            classifier,
            params,
            frame_secs,
            state: VadState::Quiet,
            starting_count: 0,
            stopping_count: 0,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Return to `Quiet` and drop any buffered partial frame.
    pub fn reset(&mut self) {
        self.state = VadState::Quiet;
        self.starting_count = 0;
        self.stopping_count = 0;
        self.pending.clear();
    }

    fn step(&mut self, speaking: bool) {
        let previous = self.state;

        if speaking {
            match self.state {
                VadState::Quiet => {
                    self.state = VadState::Starting;
                    self.starting_count = 1;
                }
                VadState::Starting => self.starting_count += 1,
                VadState::Stopping => {
                    self.state = VadState::Speaking;
                    self.stopping_count = 0;
                }
                VadState::Speaking => {}
            }
        } else {
            match self.state {
                VadState::Starting => {
                    self.state = VadState::Quiet;
                    self.starting_count = 0;
                }
                VadState::Speaking => {
                    self.state = VadState::Stopping;
                    self.stopping_count = 1;
                }
                VadState::Stopping => self.stopping_count += 1,
                VadState::Quiet => {}
            }
        }

        if self.state == VadState::Starting && self.starting_count >= self.start_frames {
            self.state = VadState::Speaking;
            self.starting_count = 0;
        }
        if self.state == VadState::Stopping && self.stopping_count >= self.stop_frames {
            self.state = VadState::Quiet;
            self.stopping_count = 0;
        }

        if self.state != previous {
            debug!("VAD {:?} -> {:?}", previous, self.state);
        }
    }
}

impl<C: FrameClassifier> VoiceActivityDetector for VadAnalyzer<C> {
    fn analyze(&mut self, chunk: &[u8]) -> VadState {
        self.pending.extend_from_slice(chunk);
        let frame_bytes = self.classifier.frame_len() * 2;
        if frame_bytes == 0 {
            return self.state;
        }

        let whole = self.pending.len() / frame_bytes * frame_bytes;
        let frames: Vec<u8> = self.pending.drain(..whole).collect();
        for frame in frames.chunks_exact(frame_bytes) {
            let samples = u8_to_i16_slice(frame);
            let confidence = self.classifier.voice_confidence(&samples);
            self.step(confidence >= self.params.confidence);
        }
        self.state
    }

    fn params(&self) -> VadParams {
        self.params
    }

    fn set_stop_secs(&mut self, secs: f32) -> f32 {
        let applied = clamp_stop_secs(secs);
        self.params.stop_secs = applied;
        self.stop_frames = frames_for(applied, self.frame_secs);
        applied
    }
}
