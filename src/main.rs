//! Rholine server
//!
//! Reads its settings from the environment (and `.env`), wires the speech
//! and language services together and serves calls on `/ws`.

use anyhow::Context;
use rholine::call::CallManager;
use rholine::config::Config;
use rholine::orchestrator::{CallContext, TurnConfig};
use rholine::server::{self, VadSettings};
use rholine::services::{
    ChatCompletionsGateway, CommandTts, GatewayConfig, HttpStt, HttpSttConfig, HttpTts, HttpTtsConfig,
    LanguageModel, Services, SideChannel, SpeechToText, TextToSpeech, WebhookForwarder,
};
use rholine::sounds::SoundBank;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn build_stt(config: &Config) -> anyhow::Result<Arc<dyn SpeechToText>> {
    #[cfg(feature = "whisper")]
    if let Some(path) = &config.stt.whisper_model_path {
        let path = path.to_string_lossy();
        info!("Using local Whisper model at {}", path);
        let stt = rholine::services::WhisperStt::new(&path, config.stt.no_speech_prob)
            .context("loading Whisper model")?;
        return Ok(Arc::new(stt));
    }
    #[cfg(not(feature = "whisper"))]
    if config.stt.whisper_model_path.is_some() {
        warn!("WHISPER_MODEL_PATH is set but the whisper feature is disabled; using HTTP STT");
    }

    let stt = HttpStt::new(HttpSttConfig {
        url: config.stt.url.clone(),
        api_key: config.stt.api_key.clone(),
        model: config.stt.model.clone(),
        no_speech_prob: config.stt.no_speech_prob,
        sample_rate: config.sample_rate,
    })?;
    info!("Using HTTP STT at {}", config.stt.url);
    Ok(Arc::new(stt))
}

fn build_tts(config: &Config) -> anyhow::Result<Arc<dyn TextToSpeech>> {
    if let Some(line) = &config.tts.command {
        let tts = CommandTts::from_command_line(line, config.sample_rate)
            .with_context(|| format!("invalid TTS_COMMAND {:?}", line))?;
        info!("Using local TTS command: {}", line);
        return Ok(Arc::new(tts));
    }

    let tts = HttpTts::new(HttpTtsConfig {
        url: config.tts.url.clone(),
        api_key: config.tts.api_key.clone(),
        model: config.tts.model.clone(),
        voice: config.tts.voice.clone(),
        source_rate: config.tts.source_rate,
        sample_rate: config.sample_rate,
    })?;
    info!("Using HTTP TTS at {} (voice {})", config.tts.url, config.tts.voice);
    Ok(Arc::new(tts))
}

fn build_services(config: &Config) -> anyhow::Result<Services> {
    let mut gateway = GatewayConfig::new(&config.llm.url, &config.llm.token);
    gateway.model = config.llm.model.clone();
    gateway.user = config.llm.user.clone();
    let llm: Arc<dyn LanguageModel> = Arc::new(ChatCompletionsGateway::new(gateway)?);

    let side_channel = match &config.forward_webhook_url {
        Some(url) => {
            info!("Long responses are forwarded to {}", url);
            Some(Arc::new(WebhookForwarder::new(url)?) as Arc<dyn SideChannel>)
        }
        None => None,
    };

    Ok(Services {
        stt: build_stt(config)?,
        llm,
        tts: build_tts(config)?,
        side_channel,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!("Starting rholine (LLM gateway {})", config.llm.url);

    let services = build_services(&config)?;
    let sounds = SoundBank::load(&config.sounds_dir, config.sample_rate);

    let ctx = CallContext {
        manager: CallManager::new(config.max_call_duration),
        services,
        sounds: Arc::new(sounds),
        config: TurnConfig::from(&config),
    };

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;

    tokio::select! {
        result = server::serve(listener, ctx, VadSettings::from_config(&config)) => {
            result.context("server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}
