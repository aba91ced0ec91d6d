//! Test doubles and a connection harness for orchestrator scenarios.

use crate::audio::i16_slice_to_u8;
use crate::call::{CallManager, CallRecord};
use crate::orchestrator::{handle_connection, CallContext, TurnConfig};
use crate::protocol::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage};
use crate::services::{
    AudioStream, ContextTurn, LanguageModel, Result, ServiceError, Services, SideChannel, SpeechToText,
    TextToSpeech,
};
use crate::sounds::SoundBank;
use crate::vad::{clamp_stop_secs, EnergyClassifier, VadAnalyzer, VadParams, VadState, VoiceActivityDetector};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// 440 Hz tone well above the energy threshold.
pub(crate) fn loud_chunk(ms: usize) -> Vec<u8> {
    let samples: Vec<i16> = (0..16 * ms)
        .map(|i| {
            let t = i as f32 / 16_000.0;
            (0.3 * i16::MAX as f32 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()) as i16
        })
        .collect();
    i16_slice_to_u8(&samples)
}

/// Low-level background noise, well below the energy threshold.
pub(crate) fn quiet_chunk(ms: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let samples: Vec<i16> = (0..16 * ms).map(|_| rng.random_range(-50i16..=50)).collect();
    i16_slice_to_u8(&samples)
}

/// Canned collaborator outcome.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    Unavailable,
    Fatal,
    /// The collaborator panics instead of returning.
    Panic,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    fn produce(&self) -> Result<String> {
        match self {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Unavailable => Err(ServiceError::Unavailable("connection refused".into())),
            Reply::Fatal => Err(ServiceError::Fatal("engine crashed".into())),
            Reply::Panic => panic!("collaborator blew up"),
        }
    }
}

pub(crate) struct StubStt {
    reply: Reply,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechToText for StubStt {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.produce()
    }
}

pub(crate) struct StubLlm {
    reply: Reply,
    pub calls: AtomicUsize,
    pub contexts: Mutex<Vec<Vec<ContextTurn>>>,
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn complete(&self, context: &[ContextTurn]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.to_vec());
        self.reply.produce()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum TtsMode {
    #[default]
    Working,
    /// `synthesize` itself fails.
    Refuse,
    /// One chunk, then a stream error, then a chunk that must never be sent.
    BreakMidStream,
}

/// Yields three short PCM chunks per request when working.
#[derive(Default)]
pub(crate) struct StubTts {
    pub texts: Mutex<Vec<String>>,
    mode: TtsMode,
}

impl StubTts {
    pub fn with_mode(mode: TtsMode) -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            mode,
        }
    }
}

#[async_trait]
impl TextToSpeech for StubTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.texts.lock().unwrap().push(text.to_string());
        let chunks: Vec<Result<Vec<u8>>> = match self.mode {
            TtsMode::Working => (1..=3u8).map(|i| Ok(vec![i; 640])).collect(),
            TtsMode::Refuse => return Err(ServiceError::Unavailable("voice server down".into())),
            TtsMode::BreakMidStream => vec![
                Ok(vec![1; 640]),
                Err(ServiceError::InvalidResponse("truncated audio".into())),
                Ok(vec![9; 640]),
            ],
        };
        Ok(stream::iter(chunks).boxed())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSideChannel {
    /// `(call_id, text)` per forward.
    pub forwarded: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingSideChannel {
    /// Records each forward, then reports it as failed.
    pub fn failing() -> Self {
        Self {
            forwarded: Mutex::new(Vec::new()),
            fail: true,
        }
    }
}

#[async_trait]
impl SideChannel for RecordingSideChannel {
    async fn forward(&self, call_id: &str, text: &str) -> Result<()> {
        self.forwarded
            .lock()
            .unwrap()
            .push((call_id.to_string(), text.to_string()));
        if self.fail {
            return Err(ServiceError::Unavailable("webhook unreachable".into()));
        }
        Ok(())
    }
}

/// Returns a fixed sequence of states, one per chunk, then `Quiet`.
pub(crate) struct ScriptedVad {
    script: VecDeque<VadState>,
    params: VadParams,
}

impl ScriptedVad {
    pub fn new(script: impl IntoIterator<Item = VadState>) -> Self {
        Self {
            script: script.into_iter().collect(),
            params: VadParams::default(),
        }
    }
}

impl VoiceActivityDetector for ScriptedVad {
    fn analyze(&mut self, _chunk: &[u8]) -> VadState {
        self.script.pop_front().unwrap_or(VadState::Quiet)
    }

    fn params(&self) -> VadParams {
        self.params
    }

    fn set_stop_secs(&mut self, secs: f32) -> f32 {
        self.params.stop_secs = clamp_stop_secs(secs);
        self.params.stop_secs
    }
}

/// Stub collaborators without a side channel.
pub(crate) fn stub_services(stt: Reply, llm: Reply) -> Services {
    Services {
        stt: Arc::new(StubStt {
            reply: stt,
            calls: AtomicUsize::new(0),
        }),
        llm: Arc::new(StubLlm {
            reply: llm,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }),
        tts: Arc::new(StubTts::default()),
        side_channel: None,
    }
}

fn energy_vad() -> Box<dyn VoiceActivityDetector> {
    let params = VadParams {
        confidence: 0.7,
        start_secs: 0.2,
        stop_secs: 0.6,
    };
    Box::new(VadAnalyzer::new(EnergyClassifier::new(0.02, 16_000), 16_000, params))
}

/// Drives `handle_connection` over in-memory channels.
///
/// The connection task is spawned lazily, so settings can be changed until
/// the first frame is awaited.
pub(crate) struct Harness {
    pub stt: Arc<StubStt>,
    pub llm: Arc<StubLlm>,
    pub tts: Arc<StubTts>,
    pub manager: CallManager,
    side_channel: Option<Arc<dyn SideChannel>>,
    sounds: SoundBank,
    config: TurnConfig,
    vad: Option<Box<dyn VoiceActivityDetector>>,
    inbound_tx: UnboundedSender<InboundFrame>,
    inbound_rx: Option<UnboundedReceiver<InboundFrame>>,
    outbound_tx: Option<UnboundedSender<OutboundFrame>>,
    outbound_rx: UnboundedReceiver<OutboundFrame>,
    task: Option<JoinHandle<Option<CallRecord>>>,
}

impl Harness {
    pub fn new(vad: Box<dyn VoiceActivityDetector>, stt: Reply, llm: Reply) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            stt: Arc::new(StubStt {
                reply: stt,
                calls: AtomicUsize::new(0),
            }),
            llm: Arc::new(StubLlm {
                reply: llm,
                calls: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
            }),
            tts: Arc::new(StubTts::default()),
            manager: CallManager::new(Duration::from_secs(30 * 60)),
            side_channel: None,
            sounds: SoundBank::default(),
            config: TurnConfig::default(),
            vad: Some(vad),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx: Some(outbound_tx),
            outbound_rx,
            task: None,
        }
    }

    /// Real energy VAD tuned for 20 ms chunks.
    pub fn energy(stt: Reply, llm: Reply) -> Self {
        Self::new(energy_vad(), stt, llm)
    }

    pub fn scripted(vad: ScriptedVad, stt: Reply, llm: Reply) -> Self {
        Self::new(Box::new(vad), stt, llm)
    }

    pub fn with_sounds(&mut self, f: impl FnOnce(SoundBank) -> SoundBank) {
        self.sounds = f(std::mem::take(&mut self.sounds));
    }

    pub fn with_side_channel(&mut self, side: RecordingSideChannel) -> Arc<RecordingSideChannel> {
        let side = Arc::new(side);
        self.side_channel = Some(side.clone());
        side
    }

    pub fn with_tts(&mut self, tts: StubTts) {
        self.tts = Arc::new(tts);
    }

    pub fn set_config(&mut self, f: impl FnOnce(&mut TurnConfig)) {
        f(&mut self.config);
    }

    pub fn set_max_duration(&mut self, max: Duration) {
        self.manager = CallManager::new(max);
    }

    fn start(&mut self) {
        let (Some(inbound), Some(outbound), Some(vad)) =
            (self.inbound_rx.take(), self.outbound_tx.take(), self.vad.take())
        else {
            return;
        };
        let ctx = CallContext {
            manager: self.manager.clone(),
            services: Services {
                stt: self.stt.clone(),
                llm: self.llm.clone(),
                tts: self.tts.clone(),
                side_channel: self.side_channel.clone(),
            },
            sounds: Arc::new(self.sounds.clone()),
            config: self.config.clone(),
        };
        self.task = Some(tokio::spawn(handle_connection(ctx, vad, inbound, outbound)));
    }

    fn push(&self, frame: InboundFrame) {
        // The connection may already be gone; that is what some tests check.
        let _ = self.inbound_tx.send(frame);
    }

    pub fn connect(&self, timezone: &str) {
        self.control(ClientMessage::Connect {
            timezone: timezone.to_string(),
        });
    }

    pub fn control(&self, msg: ClientMessage) {
        self.push(InboundFrame::Control(msg));
    }

    pub fn audio(&self, pcm: Vec<u8>) {
        self.push(InboundFrame::audio(pcm));
    }

    /// Audio with an explicit arrival time.
    pub fn audio_at(&self, pcm: Vec<u8>, received: tokio::time::Instant) {
        self.push(InboundFrame::Audio { pcm, received });
    }

    pub fn hangup(&self) {
        self.control(ClientMessage::Hangup);
    }

    pub fn close(&self) {
        self.push(InboundFrame::Closed);
    }

    pub async fn next_frame(&mut self) -> Option<OutboundFrame> {
        self.start();
        self.outbound_rx.recv().await
    }

    /// Next control message, skipping audio.
    pub async fn next_control(&mut self) -> Option<ServerMessage> {
        loop {
            match self.next_frame().await? {
                OutboundFrame::Control(msg) => return Some(msg),
                OutboundFrame::Audio(_) => continue,
            }
        }
    }

    /// Frames up to and including the first one matching `done`.
    pub async fn frames_until(&mut self, done: impl Fn(&OutboundFrame) -> bool) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            let stop = done(&frame);
            frames.push(frame);
            if stop {
                break;
            }
        }
        frames
    }

    /// Consume the handshake and opening up to the first `listening` state.
    pub async fn skip_opening(&mut self) {
        let listening = OutboundFrame::Control(ServerMessage::State {
            state: crate::protocol::UiState::Listening,
        });
        self.frames_until(|f| f == &listening).await;
    }

    /// Frames already queued, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Wait for the connection task to end.
    pub async fn finish(&mut self) -> Option<CallRecord> {
        self.start();
        match self.task.take() {
            Some(task) => task.await.expect("connection task panicked"),
            None => None,
        }
    }
}
