//! Text-to-speech engines.

use super::{AudioStream, Result, ServiceError, TextToSpeech};
use crate::audio::{i16_slice_to_u8, interpolate, u8_to_i16_slice, wav_bytes_to_pcm};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Re-frames a raw PCM byte stream and converts its sample rate.
///
/// Network chunks can split a sample in half; the odd byte is carried into
/// the next chunk. The resampling position and the last input sample also
/// carry over, so chunked output matches resampling the whole stream at once.
#[derive(Debug)]
pub struct PcmRechunker {
    from_rate: u32,
    to_rate: u32,
    carry: Vec<u8>,
    /// Last input sample seen, still needed to interpolate the next output.
    tail: Option<i16>,
    /// Absolute input index of `tail`.
    base: u64,
    /// Index of the next output sample.
    next_out: u64,
}

impl PcmRechunker {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            carry: Vec::new(),
            tail: None,
            base: 0,
            next_out: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(bytes);
        let whole = self.carry.len() & !1;
        let pcm: Vec<u8> = self.carry.drain(..whole).collect();
        if self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0 {
            return pcm;
        }

        let mut window: Vec<i16> = self.tail.into_iter().collect();
        window.extend(u8_to_i16_slice(&pcm));
        let Some(&last) = window.last() else {
            return Vec::new();
        };

        let (from, to) = (self.from_rate as u64, self.to_rate as u64);
        let mut out = Vec::new();
        loop {
            let pos = self.next_out * from;
            let idx = (pos / to - self.base) as usize;
            if idx + 1 >= window.len() {
                break;
            }
            out.push(interpolate(window[idx], window[idx + 1], pos % to, to));
            self.next_out += 1;
        }

        self.base += (window.len() - 1) as u64;
        self.tail = Some(last);
        i16_slice_to_u8(&out)
    }
}

/// Configuration for an OpenAI-compatible speech endpoint
#[derive(Debug, Clone)]
pub struct HttpTtsConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    /// Rate of the raw PCM returned by the server.
    pub source_rate: u32,
    /// Call sample rate.
    pub sample_rate: u32,
}

impl Default for HttpTtsConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            source_rate: 24_000,
            sample_rate: 16_000,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    voice: &'a str,
    input: &'a str,
    response_format: &'static str,
}

/// Streaming synthesis over `POST {url}/audio/speech`.
pub struct HttpTts {
    cfg: HttpTtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(cfg: HttpTtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { cfg, client })
    }
}

#[async_trait]
impl TextToSpeech for HttpTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let url = format!("{}/audio/speech", self.cfg.url.trim_end_matches('/'));
        let body = SpeechRequest {
            model: &self.cfg.model,
            voice: &self.cfg.voice,
            input: text,
            response_format: "pcm",
        };
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.cfg.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ServiceError::InvalidResponse(format!(
                "TTS API error {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let rechunker = PcmRechunker::new(self.cfg.source_rate, self.cfg.sample_rate);
        let audio = resp
            .bytes_stream()
            .scan(rechunker, |rechunker, item| {
                let out = item
                    .map(|bytes| rechunker.push(&bytes))
                    .map_err(ServiceError::from);
                future::ready(Some(out))
            })
            .filter(|chunk| future::ready(!matches!(chunk, Ok(pcm) if pcm.is_empty())));
        Ok(audio.boxed())
    }
}

/// Synthesis through a local program that reads text on stdin and writes a
/// WAV file to stdout.
#[derive(Debug, Clone)]
pub struct CommandTts {
    program: String,
    args: Vec<String>,
    sample_rate: u32,
}

impl CommandTts {
    pub fn new(program: impl Into<String>, args: Vec<String>, sample_rate: u32) -> Self {
        Self {
            program: program.into(),
            args,
            sample_rate,
        }
    }

    /// Split a shell-style command line on whitespace.
    pub fn from_command_line(line: &str, sample_rate: u32) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), sample_rate))
    }
}

#[async_trait]
impl TextToSpeech for CommandTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // Programs that take their input elsewhere may close stdin early.
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!("TTS command stdin: {}", e);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ServiceError::InvalidResponse(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }

        let pcm = wav_bytes_to_pcm(&output.stdout, self.sample_rate)?;
        let chunk_bytes = (self.sample_rate as usize * 2).max(2);
        debug!("TTS command produced {} bytes of PCM", pcm.len());

        let chunks: Vec<Result<Vec<u8>>> = pcm
            .chunks(chunk_bytes)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
