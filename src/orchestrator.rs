//! Per-call turn orchestration.
//!
//! One task per connection: wait for `connect`, start the call, play the
//! opening, then consume inbound frames. Each finalized utterance runs the
//! full transcribe → respond → speak pipeline before the next frame is read,
//! so audio that arrives while the bot speaks is queued, not segmented.

use crate::call::{CallManager, CallRecord, CallSession, CallState, Speaker, TimeoutCallback};
use crate::config::Config;
use crate::protocol::{ClientMessage, InboundFrame, OutboundFrame, ServerMessage, UiState};
use crate::segment::{Segmenter, Utterance};
use crate::services::{ContextTurn, ServiceError, Services};
use crate::sounds::{DayPeriod, SoundBank};
use crate::vad::VoiceActivityDetector;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Spoken when the gateway could not be reached.
pub const APOLOGY_UNAVAILABLE: &str = "I'm having trouble connecting. Please try again in a moment.";
/// Spoken when the gateway answered with something unusable.
pub const APOLOGY_INVALID: &str = "I'm sorry, I couldn't process that. Could you try again?";
/// Sent to the client before a call ends on a fatal error.
pub const APOLOGY_FATAL: &str = "Sorry, something went wrong and I have to end the call.";
/// Appended to a shortened long response.
pub const FORWARD_NOTICE: &str = "I've sent you the full details in writing.";

/// Error type for one turn of the pipeline
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Transport closed")]
    TransportClosed,
}

pub type Result<T> = std::result::Result<T, TurnError>;

/// Per-call pipeline settings
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub sample_rate: u32,
    /// How long to wait for `connect` before assuming UTC.
    pub connect_timeout: Duration,
    /// Utterances must be strictly longer than this to be transcribed.
    pub min_utterance_secs: f64,
    /// Transcript entries sent to the language model.
    pub context_turns: usize,
    /// Character count above which a response is shortened and forwarded.
    pub long_response_chars: usize,
    pub ring_pause: Duration,
    pub pickup_pause: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            connect_timeout: Duration::from_secs(10),
            min_utterance_secs: 0.5,
            context_turns: 10,
            long_response_chars: 400,
            ring_pause: Duration::from_millis(100),
            pickup_pause: Duration::from_millis(50),
        }
    }
}

impl From<&Config> for TurnConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            connect_timeout: cfg.connect_timeout,
            min_utterance_secs: cfg.min_utterance_secs,
            context_turns: cfg.context_turns,
            long_response_chars: cfg.long_response_chars,
            ..Default::default()
        }
    }
}

/// Everything a connection needs that outlives it.
#[derive(Clone)]
pub struct CallContext {
    pub manager: CallManager,
    pub services: Services,
    pub sounds: Arc<SoundBank>,
    pub config: TurnConfig,
}

/// Short spoken form of an over-long response, or `None` when `text` fits.
///
/// The spoken form is the first sentence (cut at a word boundary if it is
/// itself too long) followed by `FORWARD_NOTICE`.
pub fn shorten_for_voice(text: &str, max_chars: usize) -> Option<String> {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return None;
    }

    let mut first = first_sentence(text);
    if first.chars().count() > max_chars {
        let cut: String = first.chars().take(max_chars).collect();
        let cut = match cut.rfind(char::is_whitespace) {
            Some(idx) if idx > 0 => cut[..idx].to_string(),
            _ => cut,
        };
        first = format!("{}...", cut.trim_end());
    }
    Some(format!("{} {}", first, FORWARD_NOTICE))
}

fn first_sentence(text: &str) -> String {
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |&(_, next)| next.is_whitespace());
            if at_boundary {
                return text[..idx + c.len_utf8()].to_string();
            }
        }
    }
    text.to_string()
}

enum Flow {
    Continue,
    Hangup,
}

enum LoopExit {
    Hangup,
    Closed,
    TimedOut,
    Preempted,
    Failed(String),
    Panicked(String),
}

/// Serve one connection: handshake, opening, then the turn loop.
///
/// Returns the ended call record, or `None` when no call was started or the
/// call was taken over by a newer connection.
pub async fn handle_connection(
    ctx: CallContext,
    vad: Box<dyn VoiceActivityDetector>,
    mut inbound: UnboundedReceiver<InboundFrame>,
    outbound: UnboundedSender<OutboundFrame>,
) -> Option<CallRecord> {
    let timezone = wait_for_connect(&mut inbound, ctx.config.connect_timeout).await?;

    let timed_out = Arc::new(Notify::new());
    let waker = timed_out.clone();
    let on_timeout: TimeoutCallback = Arc::new(move |_: &str| waker.notify_one());
    let call = ctx.manager.start_call_with(Some(on_timeout));
    let session = ctx.manager.session(call.call_id.clone());

    let period = DayPeriod::now_in(&timezone);
    info!("Call {}: connected (timezone {}, {})", call.call_id, timezone, period.as_str());

    let mut orchestrator = TurnOrchestrator::new(session, ctx, vad, outbound);
    let connected = ServerMessage::Connected {
        call_id: call.call_id.clone(),
        greeting: period.as_str().to_string(),
    };
    let call_flow = async {
        orchestrator.send(connected)?;
        orchestrator.open(period).await?;
        Ok::<_, TurnError>(orchestrator.run(&mut inbound, &timed_out).await)
    };

    // A panicking collaborator must still leave the call in ERROR.
    let exit = match AssertUnwindSafe(call_flow).catch_unwind().await {
        Ok(Ok(exit)) => exit,
        Ok(Err(TurnError::TransportClosed)) => LoopExit::Closed,
        Ok(Err(TurnError::Service(e))) => LoopExit::Failed(e.to_string()),
        Err(panic) => LoopExit::Panicked(panic_message(panic.as_ref())),
    };
    orchestrator.finish(exit)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Wait for `connect{timezone}`. Audio before it is dropped.
///
/// Falls back to UTC on timeout; returns `None` if the client leaves first.
async fn wait_for_connect(
    inbound: &mut UnboundedReceiver<InboundFrame>,
    timeout: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, inbound.recv()).await {
            Err(_) => {
                debug!("No connect message within {:?}, using UTC", timeout);
                return Some("UTC".to_string());
            }
            Ok(None) | Ok(Some(InboundFrame::Closed)) => {
                info!("Client left before connecting");
                return None;
            }
            Ok(Some(InboundFrame::Control(ClientMessage::Connect { timezone }))) => {
                return Some(timezone);
            }
            Ok(Some(InboundFrame::Control(ClientMessage::Hangup))) => {
                info!("Client hung up before connecting");
                return None;
            }
            Ok(Some(_)) => continue,
        }
    }
}

/// The turn loop for one call.
pub struct TurnOrchestrator {
    session: CallSession,
    ctx: CallContext,
    vad: Box<dyn VoiceActivityDetector>,
    segmenter: Segmenter,
    outbound: UnboundedSender<OutboundFrame>,
}

impl TurnOrchestrator {
    pub fn new(
        session: CallSession,
        ctx: CallContext,
        vad: Box<dyn VoiceActivityDetector>,
        outbound: UnboundedSender<OutboundFrame>,
    ) -> Self {
        let segmenter = Segmenter::new(ctx.config.sample_rate);
        Self {
            session,
            ctx,
            vad,
            segmenter,
            outbound,
        }
    }

    pub fn call_id(&self) -> &str {
        self.session.call_id()
    }

    fn send(&self, msg: ServerMessage) -> Result<()> {
        self.outbound
            .send(OutboundFrame::Control(msg))
            .map_err(|_| TurnError::TransportClosed)
    }

    fn send_state(&self, state: UiState) -> Result<()> {
        self.send(ServerMessage::State { state })
    }

    fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(OutboundFrame::Audio(pcm.to_vec()))
            .map_err(|_| TurnError::TransportClosed)
    }

    /// Ring, pick up, greet, then listen.
    pub async fn open(&mut self, period: DayPeriod) -> Result<()> {
        let sounds = self.ctx.sounds.clone();

        self.session.transition(CallState::Ringing);
        self.send_state(UiState::Ringing)?;
        self.send_audio(&sounds.ring)?;
        tokio::time::sleep(self.ctx.config.ring_pause).await;

        self.session.transition(CallState::Answered);
        self.send_audio(&sounds.pickup)?;
        tokio::time::sleep(self.ctx.config.pickup_pause).await;

        let greeting = sounds.greeting(period);
        if !greeting.is_empty() {
            self.session.transition(CallState::Active);
            self.session.transition(CallState::Speaking);
            self.send_state(UiState::Speaking)?;
            self.send_audio(greeting)?;
            self.session.add_transcript(Speaker::Bot, &period.greeting_text());
        }

        self.session.transition(CallState::Listening);
        self.send_state(UiState::Listening)?;
        info!("Call {}: listening", self.call_id());
        Ok(())
    }

    async fn run(
        &mut self,
        inbound: &mut UnboundedReceiver<InboundFrame>,
        timed_out: &Notify,
    ) -> LoopExit {
        loop {
            if !self.session.is_current() {
                return LoopExit::Preempted;
            }
            if self.session.is_over() {
                return LoopExit::TimedOut;
            }

            let frame = tokio::select! {
                biased;
                _ = timed_out.notified() => continue,
                frame = inbound.recv() => frame,
            };

            let result = match frame {
                None | Some(InboundFrame::Closed) => return LoopExit::Closed,
                Some(InboundFrame::Control(msg)) => self.handle_control(msg),
                Some(InboundFrame::Audio { pcm, received }) => {
                    if !self.session.is_current() {
                        return LoopExit::Preempted;
                    }
                    self.handle_audio(&pcm, received.into_std())
                        .await
                        .map(|()| Flow::Continue)
                }
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Hangup) => return LoopExit::Hangup,
                Err(TurnError::TransportClosed) => return LoopExit::Closed,
                Err(TurnError::Service(e)) => return LoopExit::Failed(e.to_string()),
            }
        }
    }

    fn handle_control(&mut self, msg: ClientMessage) -> Result<Flow> {
        match msg {
            ClientMessage::Hangup => {
                info!("Call {}: user hangup", self.call_id());
                Ok(Flow::Hangup)
            }
            ClientMessage::VadStop { value } => {
                let applied = self.vad.set_stop_secs(value);
                info!("Call {}: VAD stop set to {}s", self.call_id(), applied);
                self.send(ServerMessage::VadUpdated { value: applied })?;
                Ok(Flow::Continue)
            }
            ClientMessage::Connect { .. } | ClientMessage::Unknown => Ok(Flow::Continue),
        }
    }

    /// Gaps are measured on arrival times; audio queued during a turn is
    /// processed late but keeps its original spacing.
    async fn handle_audio(&mut self, chunk: &[u8], received: std::time::Instant) -> Result<()> {
        let vad_state = self.vad.analyze(chunk);
        let Some(utterance) = self.segmenter.push(chunk, vad_state, received) else {
            return Ok(());
        };

        if utterance.duration_secs() <= self.ctx.config.min_utterance_secs {
            debug!(
                "Call {}: speech too short ({:.2}s), skipping",
                self.call_id(),
                utterance.duration_secs()
            );
            return Ok(());
        }
        self.respond(utterance).await
    }

    async fn respond(&mut self, utterance: Utterance) -> Result<()> {
        info!(
            "Call {}: transcribing {} bytes ({:.2}s)",
            self.call_id(),
            utterance.audio.len(),
            utterance.duration_secs()
        );
        self.send_state(UiState::Transcribing)?;

        let text = match self.ctx.services.stt.transcribe(&utterance.audio).await {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Call {}: transcription failed: {}", self.call_id(), e);
                String::new()
            }
        };
        if text.is_empty() || self.session.is_over() {
            return self.send_state(UiState::Listening);
        }

        info!("Call {}: user said: {}", self.call_id(), text);
        self.session.add_transcript(Speaker::User, &text);
        self.send(ServerMessage::Transcript {
            text: text.clone(),
            silence: utterance.report,
        })?;

        self.session.transition(CallState::Speaking);
        self.send_state(UiState::Thinking)?;

        let reply = self.generate_reply(&text).await?;
        if self.session.is_over() {
            return Ok(());
        }
        let spoken = self.shape_reply(reply).await;
        info!(
            "Call {}: responding: {}",
            self.call_id(),
            spoken.chars().take(80).collect::<String>()
        );

        self.session.add_transcript(Speaker::Bot, &spoken);
        self.send(ServerMessage::ResponseText {
            text: spoken.clone(),
        })?;
        self.send_state(UiState::Speaking)?;
        self.speak(&spoken).await?;

        self.send(ServerMessage::Done)?;
        self.session.transition(CallState::Listening);
        self.send_state(UiState::Listening)
    }

    /// Context is the last N transcript entries, oldest first, ending with
    /// the new utterance.
    fn build_context(&self, utterance: &str) -> Vec<ContextTurn> {
        let transcript = self.session.transcript();
        let skip = transcript.len().saturating_sub(self.ctx.config.context_turns);
        let mut context: Vec<ContextTurn> = transcript[skip..].iter().map(ContextTurn::from).collect();

        let ends_with_utterance = context
            .last()
            .is_some_and(|turn| turn == &ContextTurn::user(utterance));
        if !ends_with_utterance {
            context.push(ContextTurn::user(utterance));
        }
        context
    }

    async fn generate_reply(&self, utterance: &str) -> Result<String> {
        let context = self.build_context(utterance);
        match self.ctx.services.llm.complete(&context).await {
            Ok(reply) if !reply.trim().is_empty() => Ok(reply.trim().to_string()),
            Ok(_) => {
                warn!("Call {}: empty response from language model", self.call_id());
                Ok(APOLOGY_INVALID.to_string())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Call {}: language model failed: {}", self.call_id(), e);
                let apology = match e {
                    ServiceError::Unavailable(_) => APOLOGY_UNAVAILABLE,
                    _ => APOLOGY_INVALID,
                };
                Ok(apology.to_string())
            }
        }
    }

    /// Apply the long-response policy. The full text goes to the side
    /// channel once; a forwarding failure is only logged.
    async fn shape_reply(&self, reply: String) -> String {
        let Some(side_channel) = self.ctx.services.side_channel.as_ref() else {
            return reply;
        };
        let Some(spoken) = shorten_for_voice(&reply, self.ctx.config.long_response_chars) else {
            return reply;
        };

        info!(
            "Call {}: response is {} chars, forwarding full text",
            self.call_id(),
            reply.chars().count()
        );
        if let Err(e) = side_channel.forward(self.call_id(), &reply).await {
            warn!("Call {}: forwarding long response failed: {}", self.call_id(), e);
        }
        spoken
    }

    async fn speak(&self, text: &str) -> Result<()> {
        let mut audio = match self.ctx.services.tts.synthesize(text).await {
            Ok(stream) => stream,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Call {}: speech synthesis failed: {}", self.call_id(), e);
                return Ok(());
            }
        };

        let mut chunks = 0usize;
        while let Some(chunk) = audio.next().await {
            match chunk {
                Ok(pcm) => {
                    self.send_audio(&pcm)?;
                    chunks += 1;
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Call {}: speech stream failed: {}", self.call_id(), e);
                    break;
                }
            }
        }
        debug!("Call {}: sent {} audio chunks", self.call_id(), chunks);
        Ok(())
    }

    /// Tell the client and end the call as ERROR.
    fn fail(&self) -> Option<CallRecord> {
        let apology = ServerMessage::Error {
            message: APOLOGY_FATAL.to_string(),
        };
        if self.send(apology).is_err() {
            debug!("Call {}: client gone before the error message", self.call_id());
        }
        self.session.end(CallState::Error)
    }

    fn finish(self, exit: LoopExit) -> Option<CallRecord> {
        let call_id = self.call_id().to_string();
        let ended = match exit {
            LoopExit::Preempted => {
                info!("Call {}: replaced by a newer call, closing connection", call_id);
                return None;
            }
            LoopExit::Hangup | LoopExit::Closed => self.session.end(CallState::HangupUser),
            LoopExit::TimedOut => self.session.end(CallState::Timeout),
            LoopExit::Failed(e) => {
                error!("Call {}: pipeline error: {}", call_id, e);
                self.fail()
            }
            LoopExit::Panicked(e) => {
                error!("Call {}: pipeline panicked: {}", call_id, e);
                self.fail()
            }
        };

        if let Some(call) = &ended {
            info!(
                "Call {}: ended ({}), duration {:.1}s, {} transcript entries",
                call.call_id,
                call.state,
                call.duration().num_milliseconds() as f64 / 1000.0,
                call.transcript.len()
            );
        }
        ended
    }
}
