//! Server configuration from the environment.
//!
//! `.env` in the working directory is loaded first when present. Empty values
//! count as unset.

use crate::vad::{VadEngine, VadParams};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

const OPENAI_URL: &str = "https://api.openai.com/v1";

/// Language model gateway settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub url: String,
    pub token: String,
    pub model: String,
    pub user: String,
}

/// Speech-to-text settings
#[derive(Debug, Clone)]
pub struct SttSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub no_speech_prob: f32,
    /// Local Whisper model; used instead of the HTTP service when set.
    pub whisper_model_path: Option<PathBuf>,
}

/// Text-to-speech settings
#[derive(Debug, Clone)]
pub struct TtsSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub source_rate: u32,
    /// Local command line; used instead of the HTTP service when set.
    pub command: Option<String>,
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub sample_rate: u32,

    pub vad_engine: VadEngine,
    pub vad: VadParams,
    pub vad_energy_threshold: f32,

    pub max_call_duration: Duration,
    pub connect_timeout: Duration,

    /// Utterances must be longer than this to be transcribed.
    pub min_utterance_secs: f64,
    /// Transcript entries sent to the language model.
    pub context_turns: usize,
    /// Responses longer than this are shortened and forwarded.
    pub long_response_chars: usize,

    pub llm: LlmSettings,
    pub stt: SttSettings,
    pub tts: TtsSettings,
    pub forward_webhook_url: Option<String>,
    pub sounds_dir: PathBuf,
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn required(&self, key: &'static str, fallback: &str) -> Result<String> {
        self.get(key)
            .or_else(|| self.get(fallback))
            .ok_or(ConfigError::Missing(key))
    }
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let vad_engine = match env.get("VAD_ENGINE") {
            None => VadEngine::default(),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "VAD_ENGINE",
                value,
            })?,
        };

        let defaults = VadParams::default();
        let vad = VadParams {
            confidence: env.parse("VAD_CONFIDENCE", defaults.confidence)?,
            start_secs: env.parse("VAD_START_SECS", defaults.start_secs)?,
            stop_secs: env.parse("VAD_STOP_SECS", 0.6)?,
        };

        let max_minutes: u64 = env.parse("MAX_CALL_DURATION_MIN", 30)?;
        let connect_secs: u64 = env.parse("CONNECT_TIMEOUT_SECS", 10)?;

        let sample_rate: u32 = env.parse("SAMPLE_RATE", 16_000)?;
        if sample_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "SAMPLE_RATE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 10011)?,
            sample_rate,
            vad_engine,
            vad,
            vad_energy_threshold: env.parse("VAD_ENERGY_THRESHOLD", 0.02)?,
            max_call_duration: Duration::from_secs(max_minutes * 60),
            connect_timeout: Duration::from_secs(connect_secs),
            min_utterance_secs: env.parse("MIN_UTTERANCE_SECS", 0.5)?,
            context_turns: env.parse("CONTEXT_TURNS", 10)?,
            long_response_chars: env.parse("LONG_RESPONSE_CHARS", 400)?,
            llm: LlmSettings {
                url: env.required("LLM_URL", "OPENCLAW_URL")?,
                token: env.required("LLM_TOKEN", "OPENCLAW_TOKEN")?,
                model: env.string("LLM_MODEL", "agent:main"),
                user: env.string("LLM_USER", "main"),
            },
            stt: SttSettings {
                url: env.string("STT_URL", OPENAI_URL),
                api_key: env.get("STT_API_KEY"),
                model: env.string("STT_MODEL", "whisper-1"),
                no_speech_prob: env.parse("STT_NO_SPEECH_PROB", 0.4)?,
                whisper_model_path: env.get("WHISPER_MODEL_PATH").map(PathBuf::from),
            },
            tts: TtsSettings {
                url: env.string("TTS_URL", OPENAI_URL),
                api_key: env.get("TTS_API_KEY"),
                model: env.string("TTS_MODEL", "tts-1"),
                voice: env.string("TTS_VOICE", "alloy"),
                source_rate: env.parse("TTS_SOURCE_RATE", 24_000)?,
                command: env.get("TTS_COMMAND"),
            },
            forward_webhook_url: env.get("FORWARD_WEBHOOK_URL"),
            sounds_dir: PathBuf::from(env.string("SOUNDS_DIR", "sounds")),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [("LLM_URL", "http://127.0.0.1:28789"), ("LLM_TOKEN", "secret")];

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:10011");
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.vad_engine, VadEngine::Energy);
        assert_eq!(cfg.vad.stop_secs, 0.6);
        assert_eq!(cfg.vad.start_secs, 0.2);
        assert_eq!(cfg.max_call_duration, Duration::from_secs(30 * 60));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.min_utterance_secs, 0.5);
        assert_eq!(cfg.context_turns, 10);
        assert_eq!(cfg.long_response_chars, 400);
        assert_eq!(cfg.llm.model, "agent:main");
        assert_eq!(cfg.stt.url, OPENAI_URL);
        assert!(cfg.stt.whisper_model_path.is_none());
        assert!(cfg.tts.command.is_none());
        assert!(cfg.forward_webhook_url.is_none());
        assert_eq!(cfg.sounds_dir, PathBuf::from("sounds"));
    }

    #[test]
    fn test_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("PORT", "9000"),
            ("VAD_ENGINE", "webrtc"),
            ("VAD_STOP_SECS", "1.2"),
            ("MAX_CALL_DURATION_MIN", "5"),
            ("TTS_COMMAND", "piper --output_file -"),
            ("FORWARD_WEBHOOK_URL", "http://hooks.local/voice"),
        ]);
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.vad_engine, VadEngine::WebRtc);
        assert_eq!(cfg.vad.stop_secs, 1.2);
        assert_eq!(cfg.max_call_duration, Duration::from_secs(300));
        assert_eq!(cfg.tts.command.as_deref(), Some("piper --output_file -"));
        assert_eq!(cfg.forward_webhook_url.as_deref(), Some("http://hooks.local/voice"));
    }

    #[test]
    fn test_legacy_gateway_names() {
        let cfg = Config::from_lookup(lookup(&[
            ("OPENCLAW_URL", "http://gw"),
            ("OPENCLAW_TOKEN", "t"),
        ]))
        .unwrap();
        assert_eq!(cfg.llm.url, "http://gw");
        assert_eq!(cfg.llm.token, "t");
    }

    #[test]
    fn test_missing_gateway_is_error() {
        let err = Config::from_lookup(lookup(&[("LLM_TOKEN", "t")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("LLM_URL")));
    }

    #[test]
    fn test_invalid_number_is_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PORT", "ten"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([("PORT", ""), ("TTS_COMMAND", "  ")]);
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.port, 10011);
        assert!(cfg.tts.command.is_none());
    }

    #[test]
    fn test_unknown_vad_engine() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("VAD_ENGINE", "silero"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { key: "VAD_ENGINE", .. })
        ));
    }
}
