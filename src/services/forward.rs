use super::{Result, ServiceError, SideChannel};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForwardPayload<'a> {
    call_id: &'a str,
    text: &'a str,
}

/// Posts long responses as JSON `{callId, text}` to a webhook.
pub struct WebhookForwarder {
    url: String,
    client: reqwest::Client,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl SideChannel for WebhookForwarder {
    async fn forward(&self, call_id: &str, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&ForwardPayload { call_id, text })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ServiceError::InvalidResponse(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        info!("Call {}: forwarded {} chars", call_id, text.chars().count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(ForwardPayload {
            call_id: "abc",
            text: "details",
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"callId": "abc", "text": "details"}));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_not_fatal() {
        let forwarder = WebhookForwarder::new("http://127.0.0.1:9/hook").unwrap();
        let err = forwarder.forward("abc", "details").await.unwrap_err();
        assert!(!err.is_fatal());
    }
}
