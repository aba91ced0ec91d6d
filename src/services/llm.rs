//! Language model gateway over an OpenAI-compatible chat completions API.

use super::{ContextTurn, LanguageModel, Result, Role, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// System instruction sent ahead of the conversation.
pub const VOICE_PREAMBLE: &str = "The user is talking to you over a live voice call. \
Reply concisely in one to three sentences of plain text, because your reply will be \
converted to speech. Do not use markdown, lists, emoji or media tags.";

/// Configuration for the chat completions gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway root; `/v1/chat/completions` is appended.
    pub url: String,
    pub token: String,
    pub model: String,
    /// Session routing key sent as `user` and `X-OpenClaw-Session-Key`.
    pub user: String,
    pub timeout: Duration,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            model: "agent:main".to_string(),
            user: "main".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    user: &'a str,
    messages: Vec<ContextTurn>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

impl ChatResponse {
    fn into_text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| ServiceError::InvalidResponse("no choices in completion".to_string()))
    }
}

fn build_messages(context: &[ContextTurn]) -> Vec<ContextTurn> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.push(ContextTurn {
        role: Role::System,
        text: VOICE_PREAMBLE.to_string(),
    });
    messages.extend(context.iter().cloned());
    messages
}

/// Chat completions client.
pub struct ChatCompletionsGateway {
    cfg: GatewayConfig,
    client: reqwest::Client,
}

impl ChatCompletionsGateway {
    pub fn new(cfg: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { cfg, client })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsGateway {
    async fn complete(&self, context: &[ContextTurn]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.cfg.url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.cfg.model,
            user: &self.cfg.user,
            messages: build_messages(context),
        };
        debug!("LLM request with {} context turns", context.len());

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.token)
            .header("X-OpenClaw-Session-Key", &self.cfg.user)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ServiceError::InvalidResponse(format!(
                "LLM API error {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        resp.json::<ChatResponse>().await?.into_text()
    }
}
