//! Client for `/chat/completions` endpoints in the OpenAI wire format.
//!
//! Covers hosted services (OpenAI, OpenRouter, Groq) and local servers
//! (Ollama, vLLM, llama.cpp). Failed requests are retried with backoff when
//! the failure is transient; a stream is never retried once it has started.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use turnkeep_core::error::ProviderError;
use turnkeep_core::message::Message;
use turnkeep_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based). A server-supplied
    /// `Retry-After` wins over the exponential schedule, within `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &ProviderError) -> Duration {
        let delay = match error {
            ProviderError::RateLimited { retry_after_secs } if *retry_after_secs > 0 => {
                Duration::from_secs(*retry_after_secs)
            }
            _ => self.base_delay.saturating_mul(1 << attempt.min(16)),
        };
        delay.min(self.max_delay)
    }
}

/// A completion backend speaking the OpenAI chat format.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    json_mode: bool,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
            json_mode: true,
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Disable `response_format` for servers that reject it.
    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn body<'a>(&self, request: &'a ProviderRequest, stream: bool) -> ChatBody<'a> {
        ChatBody {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| OutgoingMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            max_tokens: request.max_tokens,
            reasoning_effort: request.reasoning_effort.as_deref(),
            stop: (!request.stop.is_empty()).then_some(request.stop.as_slice()),
            response_format: (request.json_output && self.json_mode).then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }

    async fn post_once(&self, body: &ChatBody<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body);
        if body.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = retry_after_secs(response.headers());
        let detail = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status = status.as_u16(), body = %detail, "Completion request failed");
        Err(classify_status(status, retry_after, detail))
    }

    async fn post(&self, body: &ChatBody<'_>) -> Result<reqwest::Response, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.post_once(body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt, &e);
                    attempt += 1;
                    warn!(
                        provider = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying completion request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Seconds from a `Retry-After` header. HTTP-date values are not honored.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, detail: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(0),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthenticationFailed(format!("{} rejected the API key", status.as_u16()))
        }
        _ => ProviderError::ApiError {
            status_code: status.as_u16(),
            message: detail,
        },
    }
}

fn malformed(message: impl Into<String>) -> ProviderError {
    ProviderError::ApiError {
        status_code: 200,
        message: message.into(),
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, json = request.json_output, "Completion request");
        let response = self.post(&self.body(&request, false)).await?;

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| malformed(format!("Unreadable completion body: {e}")))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| malformed("Completion had no choices"))?
            .message
            .content
            .unwrap_or_default();

        Ok(ProviderResponse {
            message: Message::assistant(content),
            usage: reply.usage.map(Usage::from),
            model: reply.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<ChunkReceiver, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Streaming request");
        let response = self.post(&self.body(&request, true)).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider = self.name.clone();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(read) = bytes.next().await {
                let data = match read {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                for event in decoder.feed(&data) {
                    let chunk = match event {
                        SseEvent::Done => {
                            let _ = tx.send(Ok(finished(None))).await;
                            return;
                        }
                        SseEvent::Malformed(err) => {
                            trace!(%provider, error = %err, "Skipping malformed stream event");
                            continue;
                        }
                        SseEvent::Delta(delta) => delta,
                    };
                    if let Some(content) = chunk.text() {
                        let partial = StreamChunk {
                            content: Some(content),
                            done: false,
                            usage: None,
                        };
                        if tx.send(Ok(partial)).await.is_err() {
                            return;
                        }
                    }
                    // Usage rides on the last event when include_usage is set
                    if let Some(usage) = chunk.usage {
                        let _ = tx.send(Ok(finished(Some(usage.into())))).await;
                        return;
                    }
                }
            }

            let _ = tx.send(Ok(finished(None))).await;
        });

        Ok(rx)
    }
}

fn finished(usage: Option<Usage>) -> StreamChunk {
    StreamChunk {
        content: None,
        done: true,
        usage,
    }
}

// ── Server-sent events ───────────────────────────────────────────────────

#[derive(Debug)]
enum SseEvent {
    Delta(StreamEvent),
    Done,
    Malformed(String),
}

/// Turns network reads into `data:` events. Bytes after the last newline
/// are held until the next read, so a line or a UTF-8 sequence split
/// across reads decodes intact.
#[derive(Debug, Default)]
struct SseDecoder {
    partial: Vec<u8>,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = decode_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }
}

/// Comments, blank lines and non-data fields yield nothing.
fn decode_line(line: &str) -> Option<SseEvent> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(match serde_json::from_str(payload) {
        Ok(event) => SseEvent::Delta(event),
        Err(e) => SseEvent::Malformed(e.to_string()),
    })
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<OutgoingMessage<'a>>,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl StreamEvent {
    /// Non-empty text carried by the first choice.
    fn text(&self) -> Option<String> {
        self.choices
            .first()?
            .delta
            .content
            .clone()
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
