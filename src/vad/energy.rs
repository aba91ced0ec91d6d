use super::analyzer::FrameClassifier;
use crate::audio::calculate_rms;

/// Classifies 20 ms frames by RMS level against a fixed threshold.
///
/// Confidence is `rms / threshold`, capped at 1.0, so a frame at exactly the
/// threshold scores 1.0.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold: f32,
    frame_len: usize,
}

impl EnergyClassifier {
    pub fn new(threshold: f32, sample_rate: u32) -> Self {
        Self {
            threshold: threshold.max(f32::EPSILON),
            frame_len: (sample_rate / 50).max(1) as usize,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl FrameClassifier for EnergyClassifier {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn voice_confidence(&mut self, frame: &[i16]) -> f32 {
        (calculate_rms(frame) / self.threshold).min(1.0)
    }
}
