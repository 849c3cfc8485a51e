//! LLM provider: wraps an external generative model behind blocking and
//! streaming interfaces.
//!
//! The model is an opaque text-in/text-out endpoint (OpenAI-compatible
//! chat completions). All operations are one-shot; a caller-supplied
//! [`CancellationToken`] aborts any in-flight request.
//!
//! Rate limits (HTTP 429) are retried with the same 2 s / 4 s / 8 s
//! backoff as the embedding provider; other upstream failures propagate.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::LlmConfig;
use crate::embedding::estimate_tokens;
use crate::error::{RecallError, Result};

const MAX_RETRIES: u32 = 3;

/// One prior turn replayed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Completed generation with token statistics.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub duration: Duration,
    pub model: String,
}

/// One frame of a streamed generation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Text(String),
    Done,
    Error(String),
}

/// Trait over the generative model, mockable in tests.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult>;

    /// Stream a generation as text chunks terminated by [`StreamEvent::Done`].
    async fn generate_stream(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Replay prior `{role, content}` pairs and generate the next reply.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<GenerationResult>;

    fn model_name(&self) -> &str;
}

/// LLM provider backed by an OpenAI-compatible chat completions endpoint.
pub struct HttpLlm {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    config: LlmConfig,
}

impl HttpLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_var).map_err(|_| {
            RecallError::Config(format!(
                "{} environment variable not set",
                config.api_key_var
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            config: config.clone(),
        })
    }

    fn request_body(&self, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        json!({
            "model": self.config.chat_model,
            "messages": messages,
            "temperature": self.config.temperature,
            "top_k": self.config.top_k,
            "top_p": self.config.top_p,
            "max_tokens": self.config.max_output_tokens,
            "stream": stream,
        })
    }

    /// Send the completion request, retrying rate limits with backoff.
    /// Cancellation aborts between attempts and mid-request.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << attempt);
                warn!(attempt, "llm rate limited, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(RecallError::Cancelled),
                }
            }

            let request = self
                .client
                .post(format!("{}/chat/completions", self.api_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send();

            let response = tokio::select! {
                r = request => r?,
                _ = cancel.cancelled() => return Err(RecallError::Cancelled),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let detail = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(RecallError::rate_limited("llm", detail));
                }
                continue;
            }

            return Err(RecallError::external("llm", format!("{status}: {detail}")));
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        self.chat(&[ChatMessage::user(prompt)], cancel).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = self.request_body(&[ChatMessage::user(prompt)], true);
        let response = self.send_with_retry(&body, cancel).await?;

        let (tx, rx) = mpsc::channel(32);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let chunk = tokio::select! {
                    c = stream.next() => c,
                    _ = cancel.cancelled() => {
                        let _ = tx.send(StreamEvent::Error("cancelled".to_string())).await;
                        return;
                    }
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            match parse_stream_line(&line) {
                                Some(StreamEvent::Done) => {
                                    let _ = tx.send(StreamEvent::Done).await;
                                    return;
                                }
                                Some(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                None => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(StreamEvent::Done).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        let started = Instant::now();
        let body = self.request_body(messages, false);
        let response = self.send_with_retry(&body, cancel).await?;
        let payload: serde_json::Value = response.json().await?;

        let text = payload
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| RecallError::external("llm", "response missing message content"))?
            .to_string();

        let usage = payload.get("usage");
        let prompt_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| {
                messages
                    .iter()
                    .map(|m| estimate_tokens(&m.content))
                    .sum()
            });
        let completion_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_i64())
            .unwrap_or_else(|| estimate_tokens(&text));

        Ok(GenerationResult {
            text,
            prompt_tokens,
            completion_tokens,
            duration: started.elapsed(),
            model: self.config.chat_model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.config.chat_model
    }
}

/// Parse one server-sent-event line of a streamed completion. Returns
/// `None` for keep-alives and frames without content.
fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }

    let payload: serde_json::Value = serde_json::from_str(data).ok()?;
    let delta = payload
        .get("choices")?
        .as_array()?
        .first()?
        .get("delta")?
        .get("content")?
        .as_str()?;

    if delta.is_empty() {
        None
    } else {
        Some(StreamEvent::Text(delta.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_line_parses_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hello"}}]}"#;
        match parse_stream_line(line) {
            Some(StreamEvent::Text(t)) => assert_eq!(t, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stream_line_parses_done() {
        assert!(matches!(
            parse_stream_line("data: [DONE]"),
            Some(StreamEvent::Done)
        ));
    }

    #[test]
    fn stream_line_ignores_noise() {
        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line(": keep-alive").is_none());
        assert!(parse_stream_line(r#"data: {"choices":[]}"#).is_none());
    }
}
