// Inference backend seam and the built-in echo provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_common::protocol::errors::ErrorCode;
use parley_common::types::{Message, MessageRole, ModelConfig};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use super::openai::OpenAiBackend;
use crate::error::ServiceError;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no inference backend for provider `{0}`")]
    UnknownProvider(String),

    #[error("invalid model parameters: {0}")]
    InvalidParams(String),

    #[error("inference backend unreachable: {0}")]
    Transport(String),

    #[error("inference backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference backend sent malformed output: {0}")]
    Protocol(String),
}

impl From<BackendError> for ServiceError {
    fn from(error: BackendError) -> Self {
        let code = match &error {
            BackendError::UnknownProvider(_) => ErrorCode::NotImplemented,
            BackendError::InvalidParams(_) => ErrorCode::InternalServerError,
            BackendError::Transport(_) | BackendError::Status { .. } | BackendError::Protocol(_) => {
                ErrorCode::BadGateway
            }
        };
        ServiceError::new(code, error.to_string())
    }
}

/// Everything a backend needs for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: ModelConfig,
    /// Conversation context, oldest message first.
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenerationSummary {
    pub token_count: usize,
    pub finish_reason: Option<String>,
}

/// A streaming text generator. Tokens are sent as they arrive; a closed
/// receiver means the caller stopped listening and generation may end early.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
        tokens: mpsc::Sender<String>,
    ) -> Result<GenerationSummary, BackendError>;
}

/// Provider name -> backend.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn InferenceBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&String> = self.backends.keys().collect();
        providers.sort();
        f.debug_struct("BackendRegistry").field("providers", &providers).finish()
    }
}

impl BackendRegistry {
    /// `echo` and `openai` providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("echo", Arc::new(EchoBackend));
        registry.register("openai", Arc::new(OpenAiBackend::new()));
        registry
    }

    pub fn register(&mut self, provider: impl Into<String>, backend: Arc<dyn InferenceBackend>) {
        self.backends.insert(provider.into(), backend);
    }

    pub fn backend_for(&self, provider: &str) -> Result<Arc<dyn InferenceBackend>, BackendError> {
        self.backends
            .get(provider)
            .cloned()
            .ok_or_else(|| BackendError::UnknownProvider(provider.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EchoParams {
    /// Pause before each token.
    delay_ms: u64,
    /// Fail with a backend error after this many tokens.
    fail_after: Option<usize>,
}

/// Repeats the last user message back one word at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn generate(
        &self,
        request: GenerationRequest,
        tokens: mpsc::Sender<String>,
    ) -> Result<GenerationSummary, BackendError> {
        let params: EchoParams = if request.model.params.is_null() {
            EchoParams::default()
        } else {
            serde_json::from_value(request.model.params.clone())
                .map_err(|error| BackendError::InvalidParams(error.to_string()))?
        };
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        let mut token_count = 0;
        for (index, word) in prompt.split_whitespace().enumerate() {
            if params.fail_after == Some(token_count) {
                return Err(BackendError::Protocol(format!(
                    "echo backend failed after {token_count} tokens"
                )));
            }
            if params.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
            }
            let token = if index == 0 { word.to_string() } else { format!(" {word}") };
            if tokens.send(token).await.is_err() {
                return Ok(GenerationSummary {
                    token_count,
                    finish_reason: Some("cancelled".to_string()),
                });
            }
            token_count += 1;
        }

        Ok(GenerationSummary { token_count, finish_reason: Some("stop".to_string()) })
    }
}
