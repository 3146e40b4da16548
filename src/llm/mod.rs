//! LLM access
//!
//! The pipeline talks to one multimodal chat endpoint through the
//! [`LlmClient`] trait: system prompt, user prompt, optional base64 PNG
//! screenshots, text back. Response JSON is recovered leniently by
//! [`protocol`].

pub mod decisions;
pub mod protocol;

pub use protocol::{parse_json_object, parse_protocol_message, ProtocolMessage};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::SpiderError;

/// Chat-completion capability the core depends on
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one exchange and return the raw assistant text
    async fn chat(
        &self,
        system: &str,
        user: &str,
        images_base64: &[String],
    ) -> Result<String, SpiderError>;
}

pub type SharedLlm = Arc<dyn LlmClient>;

/// OpenAI-compatible chat client over HTTP
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: LlmConfig,
    model: String,
}

impl OpenAiCompatClient {
    /// Build a client for the main (vision) model
    pub fn new(config: LlmConfig) -> Result<Self, SpiderError> {
        if config.api_key.trim().is_empty() {
            return Err(SpiderError::Llm(
                "missing API key (set SOMSPIDER_API_KEY)".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SpiderError::Llm(format!("http client: {e}")))?;
        let model = config.model.clone();
        Ok(Self {
            http,
            config,
            model,
        })
    }

    /// Build a client pinned to the planner model
    pub fn planner(config: LlmConfig) -> Result<Self, SpiderError> {
        let model = config
            .planner_model
            .clone()
            .unwrap_or_else(|| config.model.clone());
        let mut client = Self::new(config)?;
        client.model = model;
        Ok(client)
    }

    fn build_user_content(user: &str, images_base64: &[String]) -> Value {
        if images_base64.is_empty() {
            return Value::String(user.to_string());
        }
        let mut parts = vec![json!({"type": "text", "text": user})];
        for image in images_base64 {
            parts.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{image}")}
            }));
        }
        Value::Array(parts)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        images_base64: &[String],
    ) -> Result<String, SpiderError> {
        let endpoint = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": Self::build_user_content(user, images_base64)},
            ],
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SpiderError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| SpiderError::Llm(format!("non-JSON response: {e}")))?;

        if !status.is_success() {
            let detail = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(SpiderError::Llm(format!("HTTP {status}: {detail}")));
        }

        payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SpiderError::Llm("response missing choices[0].message.content".into()))
    }
}

/// Ask once, retry once on unparseable output, then give up.
///
/// This is the one-retry rule of the error-handling design: a second parse
/// failure surfaces as `Llm` and the caller applies its component fallback.
pub async fn chat_for_message(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
    images_base64: &[String],
) -> Result<ProtocolMessage, SpiderError> {
    for attempt in 0..2 {
        let text = llm.chat(system, user, images_base64).await?;
        if let Some(message) = parse_protocol_message(&text) {
            return Ok(message);
        }
        log::warn!(
            "LLM returned unparseable output (attempt {}): {}",
            attempt + 1,
            &text.chars().take(200).collect::<String>()
        );
    }
    Err(SpiderError::Llm("unparseable output after retry".into()))
}
