//! OpenAI-compatible `/chat/completions` gateway.
//!
//! The prompt built by the context builder is sent as a single `user`
//! message, preceded by the configured system instructions. Streaming reads
//! the server-sent-event body line by line and forwards each non-empty
//! `delta.content` as a [`StreamChunk::Token`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{GenerationStream, ModelGateway, STREAM_BUFFER, StreamChunk};
use crate::error::GatewayError;

/// Longest SSE line accepted from the backend.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct OpenAiConfig {
    /// e.g. `https://api.openai.com/v1`; `/chat/completions` is appended
    /// unless already present.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redacted(&self.api_key))
            .field("model", &self.model)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Stand-in shown for a secret in `Debug` output.
pub fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() { "<unset>" } else { "<redacted>" }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one `data:` line of the upstream stream means.
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Finished,
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, GatewayError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let envelope: StreamEnvelope =
        serde_json::from_str(data).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    let Some(choice) = envelope.choices.into_iter().next() else {
        return Ok(SseLine::Skip);
    };
    match choice.delta.content {
        Some(text) if !text.is_empty() => Ok(SseLine::Token(text)),
        _ if choice.finish_reason.is_some() => Ok(SseLine::Finished),
        _ => Ok(SseLine::Skip),
    }
}

/// Gateway talking to any OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGateway {
    client: Client,
    url: String,
    config: OpenAiConfig,
}

impl OpenAiGateway {
    pub fn new(config: OpenAiConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        let url = if config.base_url.contains("/chat/completions") {
            config.base_url.clone()
        } else {
            format!("{}/chat/completions", config.base_url.trim_end_matches('/'))
        };
        Ok(Self { client, url, config })
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, GatewayError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages: [
                WireMessage { role: "system", content: &self.config.system_prompt },
                WireMessage { role: "user", content: prompt },
            ],
            stream,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn generate_complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let completion: CompletionResponse = self
            .send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| GatewayError::Malformed("response has no choices".into()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<GenerationStream, GatewayError> {
        let response = self.send(prompt, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let body = response.bytes_stream().map(|r| r.map_err(std::io::Error::other));
            let mut lines =
                FramedRead::new(StreamReader::new(body), LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            let mut finished = false;

            while let Some(line) = lines.next().await {
                let chunk = match line {
                    Ok(line) => match parse_sse_line(&line) {
                        Ok(SseLine::Token(text)) => StreamChunk::Token(text),
                        Ok(SseLine::Finished) => {
                            finished = true;
                            continue;
                        }
                        Ok(SseLine::Done) => StreamChunk::Done,
                        Ok(SseLine::Skip) => continue,
                        Err(e) => StreamChunk::Error(e),
                    },
                    Err(e) => StreamChunk::Error(GatewayError::Transport(e.to_string())),
                };
                let terminal = !matches!(chunk, StreamChunk::Token(_));
                if tx.send(chunk).await.is_err() {
                    debug!("generation consumer went away; dropping upstream stream");
                    return;
                }
                if terminal {
                    return;
                }
            }

            // Some backends close after `finish_reason` without a `[DONE]`.
            let last = if finished {
                StreamChunk::Done
            } else {
                warn!("model stream closed before completion");
                StreamChunk::Error(GatewayError::Incomplete)
            };
            let _ = tx.send(last).await;
        });

        Ok(rx)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
