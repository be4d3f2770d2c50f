// Chat completion state machine.
//
//   Init -> Locked -> AppendingUser -> Generating -> AppendingAssistant -> Completed
//                                          |
//                                          +-> Aborted (backend error, abort, disconnect)
//
// `start` runs the synchronous phases up to and including the user-message
// append; `ActiveCompletion::run` drives generation. The streaming flag on
// the chat lock is held by the `StreamingGuard` inside `ActiveCompletion`
// and clears whenever it is dropped, on every path.

pub mod backend;
pub mod openai;

use std::sync::Arc;

use chrono::Utc;
use parley_common::protocol::errors::ErrorCode;
use parley_common::types::{
    ChatId, CompletionInfo, CompletionPhase, Message, MessageRole, ModelConfig, ModelId, NodeId,
    SessionId, UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use backend::{
    BackendError, BackendRegistry, EchoBackend, GenerationRequest, GenerationSummary,
    InferenceBackend,
};

use crate::error::{ServiceError, ServiceResult};
use crate::store::{ChatList, ChatStore, ModelStore};
use crate::sync::{ChatLockManager, StreamingGuard, VersionController};

const TOKEN_BUFFER: usize = 64;
const MAX_TITLE_CHARS: usize = 80;
const TITLE_INSTRUCTION: &str =
    "Summarize the conversation above as a short title. Reply with the title only.";

/// Parameters of `chatCompletion`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    #[serde(rename = "id")]
    pub chat_id: ChatId,
    pub model_id: ModelId,
    #[serde(default)]
    pub parent: Option<NodeId>,
    pub user_message: Message,
}

/// End-of-stream result of `chatCompletion`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub user_message_id: NodeId,
    pub assistant_message_id: NodeId,
}

/// Shared handles the completion state machine works on.
#[derive(Debug, Clone)]
pub struct CompletionCoordinator {
    chats: Arc<ChatStore>,
    chat_lists: Arc<VersionController<ChatList>>,
    locks: Arc<ChatLockManager>,
    models: Arc<ModelStore>,
    backends: BackendRegistry,
}

impl CompletionCoordinator {
    pub fn new(
        chats: Arc<ChatStore>,
        chat_lists: Arc<VersionController<ChatList>>,
        locks: Arc<ChatLockManager>,
        models: Arc<ModelStore>,
        backends: BackendRegistry,
    ) -> Self {
        Self { chats, chat_lists, locks, models, backends }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    /// Validate, lock, and append the user message.
    pub fn start(
        &self,
        owner: UserId,
        session: SessionId,
        request: CompletionRequest,
    ) -> ServiceResult<ActiveCompletion> {
        // Init
        if !self.chats.exists(owner, &request.chat_id) {
            return Err(ServiceError::not_found("chat", &request.chat_id));
        }
        let model = self.models.get(&request.model_id)?;
        let backend = self.backends.backend_for(&model.provider)?;
        if request.user_message.role != MessageRole::User {
            return Err(ServiceError::bad_request("completion input must be a user message"));
        }

        // Locked
        let guard = self.locks.begin_streaming(&request.chat_id, session)?;

        // AppendingUser
        let now = Utc::now();
        let (user_message_id, context) =
            self.chats.with_chat(owner, &request.chat_id, |chat| {
                let user_message_id =
                    chat.history.append(request.user_message, request.parent.as_deref(), now)?;
                let context: Vec<Message> =
                    chat.history.lineage(&user_message_id)?.into_iter().cloned().collect();
                chat.updated_at = now;
                chat.last_completion = Some(CompletionInfo {
                    model_id: model.id.clone(),
                    phase: CompletionPhase::Generating,
                    user_message_id: user_message_id.clone(),
                    assistant_message_id: None,
                    token_count: 0,
                    started_at: now,
                    finished_at: None,
                    error: None,
                });
                Ok((user_message_id, context))
            })?;

        info!(
            chat_id = %request.chat_id,
            model_id = %model.id,
            %session,
            context_len = context.len(),
            "completion started"
        );

        Ok(ActiveCompletion {
            owner,
            session,
            chat_id: request.chat_id,
            user_message_id,
            request: GenerationRequest { model, messages: context },
            backend,
            chats: Arc::clone(&self.chats),
            chat_lists: Arc::clone(&self.chat_lists),
            guard,
        })
    }

    /// Ask a model for a title summarizing the chat's current branch.
    pub async fn generate_title(
        &self,
        owner: UserId,
        session: SessionId,
        chat_id: &str,
        model_id: Option<ModelId>,
    ) -> ServiceResult<String> {
        let chat = self.chats.snapshot(owner, chat_id)?;
        self.locks.require_idle_holder(chat_id, session)?;
        let model_id = model_id
            .or_else(|| self.models.admin_settings().title_model_id)
            .ok_or_else(|| ServiceError::bad_request("no title model configured"))?;
        let model = self.models.get(&model_id)?;
        let backend = self.backends.backend_for(&model.provider)?;

        let head = chat
            .history
            .head()
            .cloned()
            .ok_or_else(|| ServiceError::bad_request("chat has no messages to title"))?;
        let mut messages: Vec<Message> =
            chat.history.lineage(&head)?.into_iter().cloned().collect();
        messages.push(Message { role: MessageRole::System, content: TITLE_INSTRUCTION.into() });

        let (tokens_tx, mut tokens_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let collect = async move {
            let mut raw = String::new();
            while let Some(token) = tokens_rx.recv().await {
                raw.push_str(&token);
            }
            raw
        };
        let (generated, raw) =
            tokio::join!(backend.generate(GenerationRequest { model, messages }, tokens_tx), collect);
        generated?;

        let title = normalize_title(&raw);
        if title.is_empty() {
            return Err(ServiceError::new(ErrorCode::BadGateway, "backend produced an empty title"));
        }
        Ok(title)
    }
}

/// First line of `raw`, unquoted and bounded in length.
pub fn normalize_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or_default();
    let unquoted = line.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    unquoted.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_string()
}

enum Ending {
    Finished(Result<GenerationSummary, BackendError>),
    Interrupted,
}

/// A completion past its user-message append, ready to generate.
pub struct ActiveCompletion {
    owner: UserId,
    session: SessionId,
    chat_id: ChatId,
    user_message_id: NodeId,
    request: GenerationRequest,
    backend: Arc<dyn InferenceBackend>,
    chats: Arc<ChatStore>,
    chat_lists: Arc<VersionController<ChatList>>,
    guard: StreamingGuard,
}

impl std::fmt::Debug for ActiveCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCompletion")
            .field("chat_id", &self.chat_id)
            .field("session", &self.session)
            .field("user_message_id", &self.user_message_id)
            .field("model", &self.request.model.id)
            .finish_non_exhaustive()
    }
}

impl ActiveCompletion {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn model(&self) -> &ModelConfig {
        &self.request.model
    }

    /// Generate, forwarding each token through `forward` until the backend
    /// finishes, `cancel` fires, or `forward` reports the caller is gone.
    pub async fn run<F>(
        self,
        cancel: CancellationToken,
        mut forward: F,
    ) -> ServiceResult<CompletionResult>
    where
        F: FnMut(&str) -> bool + Send,
    {
        let backend = Arc::clone(&self.backend);
        let (tokens_tx, mut tokens_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let mut content = String::new();
        let mut token_count = 0;
        let mut finished = None;

        // The generation future is dropped with this block, before the
        // outcome is recorded.
        let ending = {
            let generation = backend.generate(self.request.clone(), tokens_tx);
            tokio::pin!(generation);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ending::Interrupted,
                    maybe_token = tokens_rx.recv() => match maybe_token {
                        Some(token) => {
                            content.push_str(&token);
                            token_count += 1;
                            if !forward(&token) {
                                break Ending::Interrupted;
                            }
                        }
                        None => {
                            let result = match finished.take() {
                                Some(result) => result,
                                None => tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => break Ending::Interrupted,
                                    result = &mut generation => result,
                                },
                            };
                            break Ending::Finished(result);
                        }
                    },
                    result = &mut generation, if finished.is_none() => finished = Some(result),
                }
            }
        };

        match ending {
            Ending::Finished(Ok(summary)) => self.complete(content, token_count, summary),
            Ending::Finished(Err(error)) => {
                let error = ServiceError::from(error);
                Err(self.abort(content, token_count, error))
            }
            Ending::Interrupted => {
                let error = ServiceError::from_code(ErrorCode::StreamInterrupted);
                Err(self.abort(content, token_count, error))
            }
        }
    }

    fn complete(
        self,
        content: String,
        token_count: usize,
        summary: GenerationSummary,
    ) -> ServiceResult<CompletionResult> {
        let now = Utc::now();
        let user_message_id = self.user_message_id.clone();
        let assistant_message_id = self.chats.with_chat(self.owner, &self.chat_id, |chat| {
            let assistant_message_id =
                chat.history.append(Message::assistant(content), Some(&user_message_id), now)?;
            chat.updated_at = now;
            if let Some(info) = chat.last_completion.as_mut() {
                info.phase = CompletionPhase::Completed;
                info.assistant_message_id = Some(assistant_message_id.clone());
                info.token_count = token_count;
                info.finished_at = Some(now);
            }
            Ok(assistant_message_id)
        })?;
        self.touch_chat_list();

        info!(
            chat_id = %self.chat_id,
            token_count,
            finish_reason = summary.finish_reason.as_deref().unwrap_or("unknown"),
            "completion finished"
        );
        Ok(CompletionResult { user_message_id, assistant_message_id })
    }

    /// Record the abort, keeping partial output, and hand back `error`.
    fn abort(self, content: String, token_count: usize, error: ServiceError) -> ServiceError {
        let now = Utc::now();
        let user_message_id = self.user_message_id.clone();
        let recorded = self.chats.with_chat(self.owner, &self.chat_id, |chat| {
            let partial = if content.is_empty() {
                None
            } else {
                Some(chat.history.append(Message::assistant(content), Some(&user_message_id), now)?)
            };
            chat.updated_at = now;
            if let Some(info) = chat.last_completion.as_mut() {
                info.phase = CompletionPhase::Aborted;
                info.assistant_message_id = partial;
                info.token_count = token_count;
                info.finished_at = Some(now);
                info.error = Some(error.to_string());
            }
            Ok(())
        });
        if let Err(record_error) = recorded {
            warn!(chat_id = %self.chat_id, error = %record_error, "failed to record aborted completion");
        }
        self.touch_chat_list();

        warn!(chat_id = %self.chat_id, token_count, error = %error, "completion aborted");
        error
    }

    /// Publish the chat's new activity timestamp through the versioned list.
    fn touch_chat_list(&self) {
        let touched = self.chat_lists.mutate(self.owner, Some(self.session), None, |list| {
            let entry = self.chats.snapshot(self.owner, &self.chat_id)?.list_entry();
            list.upsert(entry);
            Ok(())
        });
        if let Err(error) = touched {
            warn!(chat_id = %self.chat_id, error = %error, "failed to update chat list activity");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use parley_common::protocol::errors::ErrorCode;
    use parley_common::protocol::push::Push;
    use parley_common::types::{
        AdminSettings, CompletionPhase, Message, MessageRole, ModelConfig, UserId,
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::{
        normalize_title, BackendError, BackendRegistry, CompletionCoordinator, CompletionRequest,
        GenerationRequest, GenerationSummary, InferenceBackend,
    };
    use crate::session::{Outbound, SessionRegistry};
    use crate::store::{ChatList, ChatRecord, ChatStore, ModelStore};
    use crate::sync::{ChatLockManager, LockState, VersionController};

    struct Fixture {
        coordinator: CompletionCoordinator,
        chats: Arc<ChatStore>,
        locks: Arc<ChatLockManager>,
        chat_lists: Arc<VersionController<ChatList>>,
        sessions: Arc<SessionRegistry>,
        models: Arc<ModelStore>,
        owner: UserId,
        chat_id: String,
    }

    /// Emits two tokens, then waits until cancelled.
    struct StallingBackend;

    #[async_trait]
    impl InferenceBackend for StallingBackend {
        async fn generate(
            &self,
            _request: GenerationRequest,
            tokens: mpsc::Sender<String>,
        ) -> Result<GenerationSummary, BackendError> {
            let _ = tokens.send("par".to_string()).await;
            let _ = tokens.send("tial".to_string()).await;
            std::future::pending::<()>().await;
            Ok(GenerationSummary::default())
        }
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionRegistry::default());
        let chats = Arc::new(ChatStore::default());
        let chat_lists = Arc::new(VersionController::new(Arc::clone(&sessions)));
        let locks = Arc::new(ChatLockManager::default());
        let models = Arc::new(ModelStore::default());
        for (id, provider, params) in [
            ("echo", "echo", json!({})),
            ("broken", "echo", json!({ "failAfter": 1 })),
            ("stall", "stall", json!({})),
            ("mystery", "llama", json!({})),
        ] {
            models
                .insert(ModelConfig {
                    id: id.into(),
                    display_name: id.into(),
                    provider: provider.into(),
                    params,
                })
                .unwrap();
        }
        let mut backends = BackendRegistry::with_defaults();
        backends.register("stall", Arc::new(StallingBackend));

        let owner = Uuid::new_v4();
        let record = ChatRecord::new(owner, Utc::now());
        let chat_id = record.id.clone();
        chat_lists
            .mutate(owner, None, None, |list: &mut ChatList| Ok(list.upsert(record.list_entry())))
            .unwrap();
        chats.insert(record);

        let coordinator = CompletionCoordinator::new(
            Arc::clone(&chats),
            Arc::clone(&chat_lists),
            Arc::clone(&locks),
            Arc::clone(&models),
            backends,
        );
        Fixture { coordinator, chats, locks, chat_lists, sessions, models, owner, chat_id }
    }

    fn request(fixture: &Fixture, model_id: &str, parent: Option<String>) -> CompletionRequest {
        CompletionRequest {
            chat_id: fixture.chat_id.clone(),
            model_id: model_id.to_string(),
            parent,
            user_message: Message::user("hello brave new world"),
        }
    }

    #[tokio::test]
    async fn completion_appends_user_and_assistant_nodes() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        fixture.sessions.register(fixture.owner, other_tx);

        let active =
            fixture.coordinator.start(fixture.owner, session, request(&fixture, "echo", None)).unwrap();
        assert!(fixture.locks.state(&fixture.chat_id).is_streaming());

        let mut streamed = Vec::new();
        let result = active
            .run(CancellationToken::new(), |token| {
                streamed.push(token.to_string());
                true
            })
            .await
            .unwrap();

        assert_eq!(streamed.concat(), "hello brave new world");
        assert_eq!(
            fixture.locks.state(&fixture.chat_id),
            LockState::Held { holder: session, streaming: false }
        );

        let chat = fixture.chats.snapshot(fixture.owner, &fixture.chat_id).unwrap();
        assert_eq!(chat.history.head(), Some(&result.assistant_message_id));
        let assistant = chat.history.get(&result.assistant_message_id).unwrap();
        assert_eq!(assistant.parent.as_deref(), Some(result.user_message_id.as_str()));
        assert_eq!(assistant.message.role, MessageRole::Assistant);
        assert_eq!(assistant.message.content, "hello brave new world");

        let info = chat.last_completion.unwrap();
        assert_eq!(info.phase, CompletionPhase::Completed);
        assert_eq!(info.token_count, 4);

        assert_eq!(fixture.chat_lists.current_version(fixture.owner), 2);
        assert_eq!(
            other_rx.try_recv().unwrap(),
            Outbound::Push(Push::ChatListVersionChanged { version: 2 })
        );
    }

    #[tokio::test]
    async fn continuation_uses_lineage_as_context() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();

        let first = fixture
            .coordinator
            .start(fixture.owner, session, request(&fixture, "echo", None))
            .unwrap()
            .run(CancellationToken::new(), |_| true)
            .await
            .unwrap();
        let second = fixture
            .coordinator
            .start(
                fixture.owner,
                session,
                request(&fixture, "echo", Some(first.assistant_message_id.clone())),
            )
            .unwrap();

        assert_eq!(second.request.messages.len(), 3);
        assert_eq!(second.request.messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn start_validates_before_locking() {
        let fixture = fixture();
        let session = Uuid::new_v4();

        let missing_chat = CompletionRequest { chat_id: "nope".into(), ..request(&fixture, "echo", None) };
        assert_eq!(
            fixture.coordinator.start(fixture.owner, session, missing_chat).unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            fixture
                .coordinator
                .start(fixture.owner, session, request(&fixture, "ghost", None))
                .unwrap_err()
                .code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            fixture
                .coordinator
                .start(fixture.owner, session, request(&fixture, "mystery", None))
                .unwrap_err()
                .code(),
            ErrorCode::NotImplemented
        );
        assert_eq!(
            fixture
                .coordinator
                .start(fixture.owner, session, request(&fixture, "echo", None))
                .unwrap_err()
                .code(),
            ErrorCode::LockNotHeld
        );
    }

    #[tokio::test]
    async fn unknown_parent_releases_streaming_flag() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();

        let error = fixture
            .coordinator
            .start(fixture.owner, session, request(&fixture, "echo", Some("missing".into())))
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::BadRequest);
        assert!(!fixture.locks.state(&fixture.chat_id).is_streaming());
        let chat = fixture.chats.snapshot(fixture.owner, &fixture.chat_id).unwrap();
        assert!(chat.history.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_and_keeps_partial_output() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();
        let active =
            fixture.coordinator.start(fixture.owner, session, request(&fixture, "stall", None)).unwrap();

        let cancel = CancellationToken::new();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let run = tokio::spawn(active.run(cancel.clone(), move |token| {
            let _ = seen_tx.send(token.to_string());
            true
        }));
        assert_eq!(seen_rx.recv().await.as_deref(), Some("par"));
        assert_eq!(seen_rx.recv().await.as_deref(), Some("tial"));
        cancel.cancel();

        let error = run.await.unwrap().unwrap_err();
        assert_eq!(error.code(), ErrorCode::StreamInterrupted);
        assert!(!fixture.locks.state(&fixture.chat_id).is_streaming());

        let chat = fixture.chats.snapshot(fixture.owner, &fixture.chat_id).unwrap();
        let info = chat.last_completion.unwrap();
        assert_eq!(info.phase, CompletionPhase::Aborted);
        let partial = info.assistant_message_id.expect("partial output is kept");
        assert_eq!(chat.history.get(&partial).unwrap().message.content, "partial");
    }

    #[tokio::test]
    async fn backend_failure_is_bad_gateway() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();

        let error = fixture
            .coordinator
            .start(fixture.owner, session, request(&fixture, "broken", None))
            .unwrap()
            .run(CancellationToken::new(), |_| true)
            .await
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::BadGateway);
        let chat = fixture.chats.snapshot(fixture.owner, &fixture.chat_id).unwrap();
        assert_eq!(chat.last_completion.unwrap().phase, CompletionPhase::Aborted);
        assert!(!fixture.locks.state(&fixture.chat_id).is_streaming());
    }

    #[tokio::test]
    async fn generate_title_falls_back_to_admin_setting() {
        let fixture = fixture();
        let session = Uuid::new_v4();
        fixture.locks.lock(&fixture.chat_id, session).unwrap();

        let no_model = fixture
            .coordinator
            .generate_title(fixture.owner, session, &fixture.chat_id, None)
            .await
            .unwrap_err();
        assert_eq!(no_model.code(), ErrorCode::BadRequest);

        fixture
            .models
            .set_admin_settings(AdminSettings {
                title_model_id: Some("echo".into()),
                default_model_id: None,
            })
            .unwrap();
        let empty_chat = fixture
            .coordinator
            .generate_title(fixture.owner, session, &fixture.chat_id, None)
            .await
            .unwrap_err();
        assert_eq!(empty_chat.code(), ErrorCode::BadRequest);

        fixture
            .coordinator
            .start(fixture.owner, session, request(&fixture, "echo", None))
            .unwrap()
            .run(CancellationToken::new(), |_| true)
            .await
            .unwrap();
        let title = fixture
            .coordinator
            .generate_title(fixture.owner, session, &fixture.chat_id, None)
            .await
            .unwrap();
        assert_eq!(title, "hello brave new world");
    }

    #[test]
    fn titles_are_single_line_and_bounded() {
        assert_eq!(normalize_title("  \"Trip planning\"\nextra"), "Trip planning");
        assert_eq!(normalize_title(&"x".repeat(200)).chars().count(), 80);
        assert_eq!(normalize_title("   "), "");
    }
}
