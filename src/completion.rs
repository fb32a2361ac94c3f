//! Clients for the external completion services.
//!
//! Two seams, both object-safe so services hold them as `Arc<dyn _>`:
//!
//! - **[`TextCompletion`]** takes a system and a user prompt and returns the
//!   model's reply, either whole or as a stream of increments. Used by the
//!   semantic chunker.
//! - **[`VisionCompletion`]** takes one page image plus an instruction and
//!   streams the model's transcription. Every stream item is the full text
//!   so far, not an increment; the transcriber diffs them.
//!
//! [`DashScopeClient`] implements both against the DashScope generation API
//! (server-sent events for streaming). [`DisabledClient`] fails every call
//! with [`CompletionError::NotConfigured`], which callers treat as "service
//! unavailable" and route to their fallbacks.
//!
//! Requests are never retried here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::CompletionConfig;
use crate::error::CompletionError;

const TEXT_GENERATION_PATH: &str = "/api/v1/services/aigc/text-generation/generation";
const MULTIMODAL_GENERATION_PATH: &str = "/api/v1/services/aigc/multimodal-generation/generation";
/// Only connecting is bounded: a streamed transcription may legitimately
/// run for minutes.
const CONNECT_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError>;

    /// Streams the reply as increments. The default issues one
    /// non-streaming request and yields its reply as a single item.
    fn complete_stream(
        &self,
        system: String,
        user: String,
    ) -> BoxStream<'_, Result<String, CompletionError>> {
        stream::once(async move { self.complete(&system, &user).await }).boxed()
    }
}

pub trait VisionCompletion: Send + Sync {
    /// Streams the cumulative transcription of `image_png`.
    fn stream_image(
        &self,
        image_png: Vec<u8>,
        instruction: String,
    ) -> BoxStream<'static, Result<String, CompletionError>>;
}

/// Picks the clients for a configuration: DashScope when the provider is
/// enabled and an API key is present, [`DisabledClient`] otherwise.
pub fn from_config(
    config: &CompletionConfig,
) -> Result<(Arc<dyn TextCompletion>, Arc<dyn VisionCompletion>), CompletionError> {
    if !config.is_enabled() {
        return Ok(disabled());
    }
    match config.api_key() {
        Some(key) => {
            let client = Arc::new(DashScopeClient::new(config, key)?);
            let text: Arc<dyn TextCompletion> = client.clone();
            let vision: Arc<dyn VisionCompletion> = client;
            Ok((text, vision))
        }
        None => {
            tracing::warn!(
                env = %config.api_key_env,
                "completion API key not set; semantic chunking and PDF transcription are unavailable"
            );
            Ok(disabled())
        }
    }
}

fn disabled() -> (Arc<dyn TextCompletion>, Arc<dyn VisionCompletion>) {
    (Arc::new(DisabledClient), Arc::new(DisabledClient))
}

/// Fails every request with [`CompletionError::NotConfigured`].
pub struct DisabledClient;

#[async_trait]
impl TextCompletion for DisabledClient {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, CompletionError> {
        Err(CompletionError::NotConfigured)
    }
}

impl VisionCompletion for DisabledClient {
    fn stream_image(
        &self,
        _image_png: Vec<u8>,
        _instruction: String,
    ) -> BoxStream<'static, Result<String, CompletionError>> {
        stream::once(async { Err(CompletionError::NotConfigured) }).boxed()
    }
}

// ── wire types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct GenerationRequest<C: Serialize> {
    model: String,
    input: GenerationInput<C>,
    parameters: GenerationParameters,
}

#[derive(Serialize)]
struct GenerationInput<C: Serialize> {
    messages: Vec<Message<C>>,
}

#[derive(Serialize)]
struct Message<C: Serialize> {
    role: &'static str,
    content: C,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ContentPart {
    Image { image: String },
    Text { text: String },
}

#[derive(Serialize, Default)]
struct GenerationParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    result_format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incremental_output: Option<bool>,
}

#[derive(Deserialize)]
struct GenerationResponse {
    output: Option<GenerationOutput>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct GenerationOutput {
    choices: Option<Vec<Choice>>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: serde_json::Value,
}

/// Extracts the reply text of one response body or stream event. Content
/// is either a string or a list of `{"text": ...}` parts.
fn reply_text(body: &str) -> Result<String, CompletionError> {
    let response: GenerationResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::Malformed(format!("{}: {}", e, truncate(body, 200))))?;

    let Some(output) = response.output else {
        let code = response.code.unwrap_or_else(|| "unknown".to_string());
        let message = response.message.unwrap_or_default();
        return Err(CompletionError::Malformed(format!("{}: {}", code, message)));
    };

    if let Some(choice) = output.choices.as_ref().and_then(|c| c.first()) {
        return Ok(content_text(&choice.message.content));
    }
    output
        .text
        .ok_or_else(|| CompletionError::Malformed("response has no choices".to_string()))
}

fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                serde_json::Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(|t| t.as_str()),
            })
            .collect(),
        _ => String::new(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Splits a server-sent-event byte stream into `data:` payloads.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feeds raw bytes; returns the payloads of every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend(bytes.iter().filter(|&&b| b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(data) = event_data(&raw) {
                events.push(data);
            }
        }
        events
    }

    /// Payload of a final event not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        event_data(&raw)
    }
}

fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|d| d.strip_prefix(' ').unwrap_or(d))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

// ── DashScope ──────────────────────────────────────────────────────────

/// DashScope generation API client.
#[derive(Clone)]
pub struct DashScopeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    text_model: String,
    vision_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl DashScopeClient {
    pub fn new(config: &CompletionConfig, api_key: String) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            text_model: config.text_model.clone(),
            vision_model: config.vision_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn text_request(&self, system: &str, user: &str, incremental: Option<bool>) -> GenerationRequest<String> {
        GenerationRequest {
            model: self.text_model.clone(),
            input: GenerationInput {
                messages: vec![
                    Message {
                        role: "system",
                        content: system.to_string(),
                    },
                    Message {
                        role: "user",
                        content: user.to_string(),
                    },
                ],
            },
            parameters: GenerationParameters {
                result_format: Some("message"),
                temperature: Some(self.temperature),
                max_tokens: Some(self.max_tokens),
                incremental_output: incremental,
            },
        }
    }

    async fn post<C: Serialize>(
        &self,
        path: &str,
        body: &GenerationRequest<C>,
        streaming: bool,
    ) -> Result<reqwest::Response, CompletionError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body);
        if streaming {
            request = request.header("X-DashScope-SSE", "enable");
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        Ok(response)
    }
}

/// Decodes an event-stream body into reply texts. Stops after the first
/// error, transport or service.
fn sse_replies<S, B>(body: S) -> BoxStream<'static, Result<String, CompletionError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(body);
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(CompletionError::Http(e));
                    return;
                }
            };
            for data in decoder.push(chunk.as_ref()) {
                let reply = reply_text(&data);
                let failed = reply.is_err();
                yield reply;
                if failed {
                    return;
                }
            }
        }
        if let Some(data) = decoder.finish() {
            yield reply_text(&data);
        }
    }
    .boxed()
}

#[async_trait]
impl TextCompletion for DashScopeClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CompletionError> {
        let body = self.text_request(system, user, None);
        tracing::debug!(model = %self.text_model, "text completion request");
        let response = self.post(TEXT_GENERATION_PATH, &body, false).await?;
        let text = response.text().await?;
        reply_text(&text)
    }

    fn complete_stream(
        &self,
        system: String,
        user: String,
    ) -> BoxStream<'_, Result<String, CompletionError>> {
        let body = self.text_request(&system, &user, Some(true));
        async_stream::stream! {
            match self.post(TEXT_GENERATION_PATH, &body, true).await {
                Ok(response) => {
                    let mut replies = sse_replies(response.bytes_stream());
                    while let Some(reply) = replies.next().await {
                        yield reply;
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        .boxed()
    }
}

impl VisionCompletion for DashScopeClient {
    fn stream_image(
        &self,
        image_png: Vec<u8>,
        instruction: String,
    ) -> BoxStream<'static, Result<String, CompletionError>> {
        let this = self.clone();
        let data_url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&image_png)
        );
        let body = GenerationRequest {
            model: this.vision_model.clone(),
            input: GenerationInput {
                messages: vec![Message {
                    role: "user",
                    content: vec![
                        ContentPart::Image { image: data_url },
                        ContentPart::Text { text: instruction },
                    ],
                }],
            },
            parameters: GenerationParameters {
                incremental_output: Some(false),
                ..Default::default()
            },
        };

        async_stream::stream! {
            tracing::debug!(model = %this.vision_model, "vision completion request");
            match this.post(MULTIMODAL_GENERATION_PATH, &body, true).await {
                Ok(response) => {
                    let mut replies = sse_replies(response.bytes_stream());
                    while let Some(reply) = replies.next().await {
                        yield reply;
                    }
                }
                Err(e) => yield Err(e),
            }
        }
        .boxed()
    }
}
