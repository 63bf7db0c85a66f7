use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub(crate) enum LlmError {
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Transport failures, timeouts and 408/429/5xx responses are worth another attempt.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Self::Malformed(_) => false,
        }
    }
}

/// OpenAI-compatible chat-completions client shared by the OCR and judgment capabilities.
#[derive(Debug, Clone)]
pub(crate) struct LlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: f64,
    timeout_secs: u64,
    max_retries: u32,
    backoff_base: Duration,
}

impl LlmClient {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let ai = settings.ai();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(ai.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: ai.api_key.clone(),
            base_url: ai.base_url.trim_end_matches('/').to_string(),
            max_tokens: ai.max_tokens,
            temperature: ai.temperature,
            timeout_secs: ai.request_timeout_secs,
            max_retries: ai.max_retries,
            backoff_base: BACKOFF_BASE,
        })
    }

    /// Sends one chat request in JSON mode and returns the parsed JSON object of the reply.
    pub(crate) async fn complete_json(
        &self,
        model: &str,
        messages: Value,
    ) -> Result<Value, LlmError> {
        let payload = json!({
            "model": model,
            "messages": messages,
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        });

        let mut attempt = 0;
        loop {
            match self.send_once(&payload).await {
                Ok(body) => return extract_message_json(&body),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = backoff_delay(self.backoff_base, attempt);
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient LLM failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, payload: &Value) -> Result<Value, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await
                .map_err(|err| {
                    if err.is_timeout() {
                        LlmError::Timeout(self.timeout_secs)
                    } else {
                        LlmError::Transport(err.to_string())
                    }
                })?;

            let status = response.status();
            let text =
                response.text().await.map_err(|err| LlmError::Transport(err.to_string()))?;
            if !status.is_success() {
                return Err(LlmError::Status { status: status.as_u16(), body: text });
            }
            serde_json::from_str::<Value>(&text).map_err(|err| LlmError::Malformed(err.to_string()))
        };

        tokio::time::timeout(Duration::from_secs(self.timeout_secs), request)
            .await
            .map_err(|_| LlmError::Timeout(self.timeout_secs))?
    }
}

/// Delay before retry `attempt` (zero-based): the base doubled per attempt, capped at a minute.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// Total time a call spends sleeping between its retries.
pub(crate) fn retry_backoff_total(max_retries: u32) -> Duration {
    (0..max_retries)
        .map(|attempt| backoff_delay(BACKOFF_BASE, attempt))
        .fold(Duration::ZERO, Duration::saturating_add)
}

fn extract_message_json(body: &Value) -> Result<Value, LlmError> {
    let content = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|value| value.as_str())
        .ok_or_else(|| LlmError::Malformed("missing message content".to_string()))?;

    parse_json_object(content)
        .ok_or_else(|| LlmError::Malformed(format!("no JSON object in reply: {}", preview(content))))
}

/// Parses a model reply that should be a JSON object, tolerating code fences and prose
/// around the object.
pub(crate) fn parse_json_object(content: &str) -> Option<Value> {
    let trimmed = strip_code_fence(content.trim());
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn strip_code_fence(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("```") else {
        return content;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn preview(content: &str) -> String {
    content.chars().take(200).collect()
}
