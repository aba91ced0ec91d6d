//! Speech-to-text engines.

use super::{Result, ServiceError, SpeechToText};
use crate::audio::{encode_wav, u8_to_i16_slice};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Configuration for an OpenAI-compatible transcription endpoint
#[derive(Debug, Clone)]
pub struct HttpSttConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Segments with a higher no-speech probability are dropped.
    pub no_speech_prob: f32,
    pub sample_rate: u32,
}

impl Default for HttpSttConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            no_speech_prob: 0.4,
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionSegment {
    text: String,
    #[serde(default)]
    no_speech_prob: f32,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Option<Vec<TranscriptionSegment>>,
}

impl TranscriptionResponse {
    /// Text of the confident segments, or the plain text when the server
    /// returned no segment detail.
    fn confident_text(&self, max_no_speech_prob: f32) -> String {
        match &self.segments {
            Some(segments) => segments
                .iter()
                .filter(|seg| seg.no_speech_prob <= max_no_speech_prob)
                .map(|seg| seg.text.trim())
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            None => self.text.trim().to_string(),
        }
    }
}

/// Transcription over `POST {url}/audio/transcriptions`.
pub struct HttpStt {
    cfg: HttpSttConfig,
    client: reqwest::Client,
}

impl HttpStt {
    pub fn new(cfg: HttpSttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { cfg, client })
    }
}

#[async_trait]
impl SpeechToText for HttpStt {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        if audio.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&u8_to_i16_slice(audio), self.cfg.sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.cfg.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);

        let url = format!("{}/audio/transcriptions", self.cfg.url.trim_end_matches('/'));
        let mut request = self.client.post(&url).multipart(form);
        if let Some(key) = &self.cfg.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::InvalidResponse(format!(
                "STT API error {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let parsed: TranscriptionResponse = resp.json().await?;
        let text = parsed.confident_text(self.cfg.no_speech_prob);
        if text.is_empty() && !parsed.text.trim().is_empty() {
            debug!("STT dropped low-confidence text: {}", parsed.text.trim());
        }
        Ok(text)
    }
}

#[cfg(feature = "whisper")]
mod local {
    use super::*;
    use std::sync::Arc;
    use tracing::warn;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// On-device Whisper transcription through whisper.cpp.
    pub struct WhisperStt {
        ctx: Arc<WhisperContext>,
        no_speech_prob: f32,
    }

    impl WhisperStt {
        /// Load a ggml model file.
        pub fn new(model_path: &str, no_speech_prob: f32) -> Result<Self> {
            let ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| ServiceError::Fatal(format!("Whisper load failed: {}", e)))?;
            Ok(Self {
                ctx: Arc::new(ctx),
                no_speech_prob,
            })
        }
    }

    #[async_trait]
    impl SpeechToText for WhisperStt {
        async fn transcribe(&self, audio: &[u8]) -> Result<String> {
            let samples: Vec<f32> = u8_to_i16_slice(audio)
                .into_iter()
                .map(|s| s as f32 / 32768.0)
                .collect();
            if samples.is_empty() {
                return Ok(String::new());
            }
            let ctx = self.ctx.clone();
            let no_speech_prob = self.no_speech_prob;

            tokio::task::spawn_blocking(move || {
                let mut state = ctx
                    .create_state()
                    .map_err(|e| ServiceError::Unavailable(format!("Whisper state: {}", e)))?;

                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_print_timestamps(false);
                params.set_language(Some("en"));
                params.set_no_context(true);
                params.set_no_speech_thold(no_speech_prob);

                state
                    .full(params, &samples)
                    .map_err(|e| ServiceError::InvalidResponse(format!("Whisper inference: {}", e)))?;
                let n = state
                    .full_n_segments()
                    .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

                let mut parts = Vec::new();
                for i in 0..n {
                    match state.full_get_segment_text(i) {
                        Ok(text) if !text.trim().is_empty() => parts.push(text.trim().to_string()),
                        Ok(_) => {}
                        Err(e) => warn!("Whisper segment {}: {}", i, e),
                    }
                }
                Ok(parts.join(" "))
            })
            .await
            .map_err(|e| ServiceError::Fatal(format!("Whisper worker panicked: {}", e)))?
        }
    }
}

#[cfg(feature = "whisper")]
pub use local::WhisperStt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_confidence_segments_dropped() {
        let resp: TranscriptionResponse = serde_json::from_str(
            r#"{
                "text": " Hello there. Thanks for watching!",
                "segments": [
                    {"text": " Hello there.", "no_speech_prob": 0.05},
                    {"text": " Thanks for watching!", "no_speech_prob": 0.92}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(resp.confident_text(0.4), "Hello there.");
    }

    #[test]
    fn test_plain_text_without_segments() {
        let resp: TranscriptionResponse = serde_json::from_str(r#"{"text": "  what time is it "}"#).unwrap();
        assert_eq!(resp.confident_text(0.4), "what time is it");
    }

    #[test]
    fn test_all_segments_silent_is_empty() {
        let resp: TranscriptionResponse = serde_json::from_str(
            r#"{"text": "you", "segments": [{"text": "you", "no_speech_prob": 0.8}]}"#,
        )
        .unwrap();
        assert!(resp.confident_text(0.4).is_empty());
    }

    #[tokio::test]
    async fn test_empty_audio_skips_request() {
        let stt = HttpStt::new(HttpSttConfig {
            url: "http://127.0.0.1:9".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(stt.transcribe(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_degraded() {
        let stt = HttpStt::new(HttpSttConfig {
            url: "http://127.0.0.1:9".into(),
            ..Default::default()
        })
        .unwrap();
        let err = stt.transcribe(&[0u8; 3_200]).await.unwrap_err();
        assert!(!err.is_fatal());
    }
}
