use super::analyzer::FrameClassifier;
use super::VadError;
use tracing::warn;
use webrtc_vad::{SampleRate, Vad, VadMode};

struct SendVad(Vad);

// SAFETY: the fvad handle is heap-allocated, owned solely by this wrapper and
// only touched through `&mut self`; it holds no thread-local state. With no
// `&self` access, sharing references across threads cannot reach it.
unsafe impl Send for SendVad {}
unsafe impl Sync for SendVad {}

/// WebRTC voice detector on 20 ms frames. Binary decision: 1.0 or 0.0.
pub struct WebRtcClassifier {
    vad: SendVad,
    frame_len: usize,
}

impl WebRtcClassifier {
    pub fn new(sample_rate: u32) -> Result<Self, VadError> {
        let rate = match sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            rate => {
                return Err(VadError::UnsupportedSampleRate {
                    engine: "webrtc",
                    rate,
                })
            }
        };
        let vad = Vad::new_with_rate_and_mode(rate, VadMode::VeryAggressive);
        Ok(Self {
            vad: SendVad(vad),
            frame_len: (sample_rate / 50) as usize,
        })
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn voice_confidence(&mut self, frame: &[i16]) -> f32 {
        match self.vad.0.is_voice_segment(frame) {
            Ok(true) => 1.0,
            Ok(false) => 0.0,
            Err(()) => {
                warn!("WebRTC VAD rejected a {} sample frame", frame.len());
                0.0
            }
        }
    }
}
