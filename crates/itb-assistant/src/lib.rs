//! Natural-language fallback responder.
//!
//! Free text that is not part of any bot flow goes to an OpenAI-compatible
//! chat-completions endpoint (OpenRouter by default). Enabled only when an
//! API key is configured; failures surface as typed errors the Telegram layer
//! turns into a short apology, never a crash.

use itb_core::{errors::Error, Result};

const SYSTEM_PROMPT: &str = "You are an AI assistant for a Telegram bot that manages \
an Instagram account. Answer clearly and briefly, without filler.";

#[derive(Clone, Debug)]
pub struct AssistantClient {
    api_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl AssistantClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            http,
        }
    }

    pub async fn reply(&self, user_message: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_message},
            ],
            "max_tokens": 500,
            "temperature": 0.7,
        });

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::External(format!("assistant request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "assistant request failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("assistant json error: {e}")))?;

        let text = v
            .pointer("/choices/0/message/content")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        if text.is_empty() {
            return Err(Error::External(
                "assistant returned an empty reply".to_string(),
            ));
        }

        Ok(text)
    }
}
