// OpenAI-compatible `/chat/completions` client with SSE token streaming.

use async_trait::async_trait;
use parley_common::types::{Message, MessageRole};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::backend::{BackendError, GenerationRequest, GenerationSummary, InferenceBackend};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenAiParams {
    base_url: String,
    model: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One decoded server-sent event payload.
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Token(String),
    Finish(String),
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct OpenAiBackend {
    client: Client,
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn generate(
        &self,
        request: GenerationRequest,
        tokens: mpsc::Sender<String>,
    ) -> Result<GenerationSummary, BackendError> {
        let params: OpenAiParams = serde_json::from_value(request.model.params.clone())
            .map_err(|error| BackendError::InvalidParams(error.to_string()))?;
        let body = ChatCompletionRequest {
            model: &params.model,
            messages: request.messages.iter().map(wire_message).collect(),
            stream: true,
            temperature: params.temperature,
        };
        let url = format!("{}/chat/completions", params.base_url.trim_end_matches('/'));
        debug!(model = %params.model, url = %url, messages = body.messages.len(), "starting completion request");

        let mut builder = self.client.post(&url).json(&body);
        if let Some(api_key) = params.api_key.as_deref().filter(|key| !key.is_empty()) {
            builder = builder.bearer_auth(api_key);
        }
        let mut response =
            builder.send().await.map_err(|error| BackendError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        let mut summary = GenerationSummary::default();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) =
            response.chunk().await.map_err(|error| BackendError::Transport(error.to_string()))?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(event) = take_event(&mut buffer) {
                let event = String::from_utf8(event).map_err(|error| {
                    BackendError::Protocol(format!("stream event is not utf-8: {error}"))
                })?;
                for decoded in parse_sse_event(&event)? {
                    match decoded {
                        SseEvent::Token(token) => {
                            if tokens.send(token).await.is_err() {
                                summary.finish_reason = Some("cancelled".to_string());
                                return Ok(summary);
                            }
                            summary.token_count += 1;
                        }
                        SseEvent::Finish(reason) => summary.finish_reason = Some(reason),
                        SseEvent::Done => return Ok(summary),
                    }
                }
            }
        }

        Ok(summary)
    }
}

fn wire_message(message: &Message) -> WireMessage<'_> {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };
    WireMessage { role, content: &message.content }
}

/// Split the first complete event (terminated by a blank line) off the
/// front of `buffer`. Separators are ASCII, so a complete event never ends
/// inside a multi-byte character.
fn take_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (end, separator) = [b"\r\n\r\n".as_slice(), b"\n\n".as_slice()]
        .into_iter()
        .filter_map(|separator| {
            buffer
                .windows(separator.len())
                .position(|window| window == separator)
                .map(|end| (end, separator.len()))
        })
        .min_by_key(|(end, _)| *end)?;
    let mut event: Vec<u8> = buffer.drain(..end + separator).collect();
    event.truncate(end);
    Some(event)
}

fn parse_sse_event(event: &str) -> Result<Vec<SseEvent>, BackendError> {
    let mut decoded = Vec::new();
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            decoded.push(SseEvent::Done);
            break;
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(data)
            .map_err(|error| BackendError::Protocol(format!("invalid stream chunk: {error}")))?;
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                decoded.push(SseEvent::Token(content));
            }
            if let Some(reason) = choice.finish_reason {
                decoded.push(SseEvent::Finish(reason));
            }
        }
    }
    Ok(decoded)
}
