use std::sync::Arc;

use chrono::Utc;
use parley_common::metadata::{normalize_key, MetadataPath};
use parley_common::protocol::errors::ErrorCode;
use parley_common::protocol::push::Push;
use parley_common::protocol::rpc::Request;
use parley_common::protocol::rpc_methods::*;
use parley_common::types::{AdminSettings, ChatId, ModelConfig, ModelId, SessionId, UserId, UserRole};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::auth::{Authenticator, StoreAuthenticator, UserIdentity};
use crate::completion::{ActiveCompletion, BackendRegistry, CompletionCoordinator, CompletionRequest};
use crate::error::{ServiceError, ServiceResult};
use crate::session::SessionRegistry;
use crate::store::{
    access_for, ChatList, ChatRecord, ChatStore, MetadataScope, MetadataStore, ModelPatch,
    ModelStore, UserStore,
};
use crate::sync::{ChatLockManager, Version, VersionController};

// ── Server state ────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RpcServerState {
    sessions: Arc<SessionRegistry>,
    chats: Arc<ChatStore>,
    chat_lists: Arc<VersionController<ChatList>>,
    locks: Arc<ChatLockManager>,
    metadata: Arc<MetadataStore>,
    models: Arc<ModelStore>,
    users: Arc<UserStore>,
    completions: CompletionCoordinator,
    authenticator: Arc<dyn Authenticator>,
}

impl Default for RpcServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServerState {
    pub fn new() -> Self {
        let sessions = Arc::new(SessionRegistry::default());
        let chats = Arc::new(ChatStore::default());
        let chat_lists = Arc::new(VersionController::new(Arc::clone(&sessions)));
        let locks = Arc::new(ChatLockManager::default());
        let models = Arc::new(ModelStore::default());
        let users = Arc::new(UserStore::default());
        let completions = CompletionCoordinator::new(
            Arc::clone(&chats),
            Arc::clone(&chat_lists),
            Arc::clone(&locks),
            Arc::clone(&models),
            BackendRegistry::with_defaults(),
        );
        let authenticator = Arc::new(StoreAuthenticator::new(Arc::clone(&users)));

        Self {
            sessions,
            chats,
            chat_lists,
            locks,
            metadata: Arc::new(MetadataStore::default()),
            models,
            users,
            completions,
            authenticator,
        }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.completions = self.completions.with_backends(backends);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn locks(&self) -> &Arc<ChatLockManager> {
        &self.locks
    }

    pub fn models(&self) -> &Arc<ModelStore> {
        &self.models
    }

    pub fn users(&self) -> &Arc<UserStore> {
        &self.users
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}

/// The caller of one RPC: which connection, and who is on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub session_id: SessionId,
    pub user: UserIdentity,
}

impl CallContext {
    fn owner(&self) -> UserId {
        self.user.user_id
    }
}

/// Forget a closed session: unregister it and unlock every chat it held.
pub fn disconnect_session(state: &RpcServerState, session_id: SessionId) {
    state.sessions.unregister(session_id);
    let released = state.locks.release_session(session_id);
    if !released.is_empty() {
        debug!(%session_id, chats = ?released, "unlocked chats of closed session");
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

/// Run one request/response call.
pub async fn dispatch_call(
    request: Request,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params = request.params;
    match request.method.as_str() {
        GET_CHAT_LIST_VERSION => handle_get_chat_list_version(ctx, state),
        GET_CHAT_LIST => handle_get_chat_list(params, ctx, state),
        NEW_CHAT => handle_new_chat(params, ctx, state),
        LOCK_CHAT => handle_lock_chat(params, ctx, state),
        DELETE_CHAT => handle_delete_chat(params, ctx, state),
        GET_CHAT => handle_get_chat(params, ctx, state),
        SET_CHAT_TITLE => handle_set_chat_title(params, ctx, state),
        GENERATE_CHAT_TITLE => handle_generate_chat_title(params, ctx, state).await,
        GET_LAST_COMPLETION_INFO => handle_get_last_completion_info(params, ctx, state),
        SET_METADATA => handle_set_metadata(params, ctx, state),
        GET_METADATA => handle_get_metadata(params, ctx, state),
        DELETE_METADATA => handle_delete_metadata(params, ctx, state),
        SET_CHAT_METADATA => handle_set_chat_metadata(params, ctx, state),
        GET_CHAT_METADATA => handle_get_chat_metadata(params, ctx, state),
        DELETE_CHAT_METADATA => handle_delete_chat_metadata(params, ctx, state),
        GET_MODELS => to_result(state.models.list()),
        NEW_MODEL => handle_new_model(params, ctx, state),
        GET_MODEL_PARAMS => handle_get_model_params(params, ctx, state),
        MODIFY_MODEL => handle_modify_model(params, ctx, state),
        DELETE_MODEL => handle_delete_model(params, ctx, state),
        GET_USER_INFO => to_result(state.users.get(ctx.owner())?),
        LIST_USERS => {
            require_admin(ctx)?;
            to_result(state.users.list())
        }
        NEW_USER => handle_new_user(params, ctx, state).await,
        DELETE_USER => handle_delete_user(params, ctx, state),
        GET_ADMIN_SETTINGS => {
            require_admin(ctx)?;
            to_result(state.models.admin_settings())
        }
        SET_ADMIN_SETTINGS => handle_set_admin_settings(params, ctx, state),
        SET_CREDENTIAL => handle_set_credential(params, ctx, state).await,
        other => Err(ServiceError::new(
            ErrorCode::NotImplemented,
            format!("method `{other}` is not implemented"),
        )),
    }
}

/// Run the synchronous phases of `chatCompletion`.
pub fn start_completion(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<ActiveCompletion> {
    let request: CompletionRequest = parse_params(params)?;
    state.completions.start(ctx.owner(), ctx.session_id, request)
}

pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> ServiceResult<T> {
    let params = if params.is_null() { Value::Object(Map::new()) } else { params };
    serde_json::from_value(params)
        .map_err(|error| ServiceError::bad_request(format!("invalid params: {error}")))
}

fn to_result<T: Serialize>(value: T) -> ServiceResult<Value> {
    serde_json::to_value(value)
        .map_err(|error| ServiceError::internal(format!("failed to encode result: {error}")))
}

fn require_admin(ctx: &CallContext) -> ServiceResult<()> {
    if ctx.user.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::unauthorized("admin role required"))
    }
}

fn require_chat(ctx: &CallContext, state: &RpcServerState, chat_id: &str) -> ServiceResult<()> {
    if state.chats.exists(ctx.owner(), chat_id) {
        Ok(())
    } else {
        Err(ServiceError::not_found("chat", chat_id))
    }
}

fn notify_settings_changed(ctx: &CallContext, state: &RpcServerState) {
    let notified = state.sessions.notify_all(Some(ctx.session_id), Push::SettingsChanged);
    debug!(notified, "settings change pushed");
}

// ── Chats ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VersionParams {
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Debug, Deserialize)]
struct ChatIdParams {
    id: ChatId,
}

#[derive(Debug, Deserialize)]
struct DeleteChatParams {
    id: ChatId,
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Debug, Deserialize)]
struct SetChatTitleParams {
    id: ChatId,
    title: String,
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChatTitleParams {
    id: ChatId,
    #[serde(default)]
    model_id: Option<ModelId>,
}

fn handle_get_chat_list_version(ctx: &CallContext, state: &RpcServerState) -> ServiceResult<Value> {
    Ok(json!({ "version": state.chat_lists.current_version(ctx.owner()) }))
}

fn handle_get_chat_list(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: VersionParams = parse_params(params)?;
    let (version, chats) =
        state.chat_lists.check_read(ctx.owner(), params.version, ChatList::entries)?;
    Ok(json!({ "version": version, "chats": chats }))
}

fn handle_new_chat(params: Value, ctx: &CallContext, state: &RpcServerState) -> ServiceResult<Value> {
    let params: VersionParams = parse_params(params)?;
    let record = ChatRecord::new(ctx.owner(), Utc::now());
    let (version, chat_id) =
        state.chat_lists.mutate(ctx.owner(), Some(ctx.session_id), params.version, |list| {
            let chat_id = record.id.clone();
            list.upsert(record.list_entry());
            state.chats.insert(record);
            Ok(chat_id)
        })?;
    info!(%chat_id, version, user_id = %ctx.owner(), "chat created");
    Ok(json!({ "id": chat_id, "version": version }))
}

fn handle_lock_chat(params: Value, ctx: &CallContext, state: &RpcServerState) -> ServiceResult<Value> {
    let params: ChatIdParams = parse_params(params)?;
    require_chat(ctx, state, &params.id)?;
    let outcome = state.locks.lock(&params.id, ctx.session_id)?;
    Ok(json!({ "alreadyHeld": outcome.already_held }))
}

fn handle_delete_chat(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: DeleteChatParams = parse_params(params)?;
    require_chat(ctx, state, &params.id)?;
    let (version, ()) =
        state.chat_lists.mutate(ctx.owner(), Some(ctx.session_id), params.version, |list| {
            state.locks.with_held(&params.id, ctx.session_id, || {
                state.chats.remove(ctx.owner(), &params.id)?;
                list.remove(&params.id);
                Ok(())
            })
        })?;
    state.locks.remove(&params.id);
    state.metadata.clear(&MetadataScope::Chat(params.id.clone()));
    info!(chat_id = %params.id, version, "chat deleted");
    Ok(json!({ "version": version }))
}

fn handle_get_chat(params: Value, ctx: &CallContext, state: &RpcServerState) -> ServiceResult<Value> {
    let params: ChatIdParams = parse_params(params)?;
    let chat = state.chats.snapshot(ctx.owner(), &params.id)?;
    to_result(chat.view())
}

fn handle_set_chat_title(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: SetChatTitleParams = parse_params(params)?;
    let title = params.title.trim();
    if title.is_empty() {
        return Err(ServiceError::bad_request("title must not be empty"));
    }
    require_chat(ctx, state, &params.id)?;
    let version = apply_title(ctx, state, &params.id, title.to_string(), params.version)?;
    Ok(json!({ "version": version }))
}

async fn handle_generate_chat_title(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: GenerateChatTitleParams = parse_params(params)?;
    let title = state
        .completions
        .generate_title(ctx.owner(), ctx.session_id, &params.id, params.model_id)
        .await?;
    let version = apply_title(ctx, state, &params.id, title.clone(), None)?;
    Ok(json!({ "title": title, "version": version }))
}

/// Rename a chat under the aggregate, the lock and the chat record, in
/// that order.
fn apply_title(
    ctx: &CallContext,
    state: &RpcServerState,
    chat_id: &str,
    title: String,
    reference: Option<Version>,
) -> ServiceResult<Version> {
    let (version, ()) =
        state.chat_lists.mutate(ctx.owner(), Some(ctx.session_id), reference, |list| {
            state.locks.with_held(chat_id, ctx.session_id, || {
                state.chats.with_chat(ctx.owner(), chat_id, |chat| {
                    chat.title = title;
                    chat.updated_at = Utc::now();
                    list.upsert(chat.list_entry());
                    Ok(())
                })
            })
        })?;
    Ok(version)
}

fn handle_get_last_completion_info(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: ChatIdParams = parse_params(params)?;
    let chat = state.chats.snapshot(ctx.owner(), &params.id)?;
    to_result(chat.last_completion)
}

// ── Metadata ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SetMetadataParams {
    path: MetadataPath,
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct GetMetadataParams {
    path: MetadataPath,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteMetadataParams {
    path: MetadataPath,
    key: String,
}

#[derive(Debug, Deserialize)]
struct SetChatMetadataParams {
    id: ChatId,
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
struct GetChatMetadataParams {
    id: ChatId,
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteChatMetadataParams {
    id: ChatId,
    key: String,
}

/// Role check, then existence of the owning resource.
fn authorize_metadata(
    ctx: &CallContext,
    state: &RpcServerState,
    path: &MetadataPath,
    write: bool,
) -> ServiceResult<MetadataScope> {
    let access = access_for(path, ctx.owner(), ctx.user.role);
    let allowed = if write { access.can_write() } else { access.can_read() };
    if !allowed {
        return Err(ServiceError::unauthorized(format!(
            "caller may not {} metadata at `{path}`",
            if write { "write" } else { "read" }
        )));
    }

    match path {
        MetadataPath::Global | MetadataPath::User => {}
        MetadataPath::Model(model_id) => {
            if !state.models.contains(model_id) {
                return Err(ServiceError::not_found("model", model_id));
            }
        }
        MetadataPath::UserPublic(user_id) => {
            state.users.get(*user_id)?;
        }
        MetadataPath::Chat(chat_id) => require_chat(ctx, state, chat_id)?,
    }
    Ok(MetadataScope::resolve(path, ctx.owner()))
}

/// Run a metadata write, pinned to the chat lock for chat scopes.
fn write_metadata<R>(
    ctx: &CallContext,
    state: &RpcServerState,
    scope: &MetadataScope,
    write: impl FnOnce() -> R,
) -> ServiceResult<R> {
    match scope {
        MetadataScope::Chat(chat_id) => {
            state.locks.with_held(chat_id, ctx.session_id, || Ok(write()))
        }
        _ => Ok(write()),
    }
}

fn set_metadata(
    ctx: &CallContext,
    state: &RpcServerState,
    path: MetadataPath,
    key: &str,
    value: Value,
) -> ServiceResult<Value> {
    let key = normalize_key(key)?;
    let scope = authorize_metadata(ctx, state, &path, true)?;
    write_metadata(ctx, state, &scope, || state.metadata.set(scope.clone(), key, value))?;
    Ok(json!({}))
}

fn get_metadata(
    ctx: &CallContext,
    state: &RpcServerState,
    path: MetadataPath,
    key: Option<String>,
) -> ServiceResult<Value> {
    let key = key.as_deref().map(normalize_key).transpose()?;
    let scope = authorize_metadata(ctx, state, &path, false)?;
    if let MetadataScope::Chat(chat_id) = &scope {
        state.locks.require_holder(chat_id, ctx.session_id)?;
    }
    Ok(json!({ "value": state.metadata.get(&scope, key.as_deref()) }))
}

fn delete_metadata(
    ctx: &CallContext,
    state: &RpcServerState,
    path: MetadataPath,
    key: &str,
) -> ServiceResult<Value> {
    let key = normalize_key(key)?;
    let scope = authorize_metadata(ctx, state, &path, true)?;
    let deleted = write_metadata(ctx, state, &scope, || state.metadata.delete(&scope, &key))?;
    Ok(json!({ "deleted": deleted }))
}

fn handle_set_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: SetMetadataParams = parse_params(params)?;
    set_metadata(ctx, state, params.path, &params.key, params.value)
}

fn handle_get_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: GetMetadataParams = parse_params(params)?;
    get_metadata(ctx, state, params.path, params.key)
}

fn handle_delete_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: DeleteMetadataParams = parse_params(params)?;
    delete_metadata(ctx, state, params.path, &params.key)
}

fn handle_set_chat_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: SetChatMetadataParams = parse_params(params)?;
    set_metadata(ctx, state, MetadataPath::Chat(params.id), &params.key, params.value)
}

fn handle_get_chat_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: GetChatMetadataParams = parse_params(params)?;
    get_metadata(ctx, state, MetadataPath::Chat(params.id), params.key)
}

fn handle_delete_chat_metadata(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: DeleteChatMetadataParams = parse_params(params)?;
    delete_metadata(ctx, state, MetadataPath::Chat(params.id), &params.key)
}

// ── Models ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewModelParams {
    #[serde(default)]
    id: Option<ModelId>,
    display_name: String,
    provider: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ModelIdParams {
    id: ModelId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyModelParams {
    id: ModelId,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

fn handle_new_model(params: Value, ctx: &CallContext, state: &RpcServerState) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: NewModelParams = parse_params(params)?;
    let id = state.models.insert(ModelConfig {
        id: params.id.unwrap_or_default(),
        display_name: params.display_name,
        provider: params.provider,
        params: params.params,
    })?;
    notify_settings_changed(ctx, state);
    info!(model_id = %id, "model created");
    Ok(json!({ "id": id }))
}

fn handle_get_model_params(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: ModelIdParams = parse_params(params)?;
    let model = state.models.get(&params.id)?;
    Ok(json!({ "params": model.params }))
}

fn handle_modify_model(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: ModifyModelParams = parse_params(params)?;
    state.models.modify(
        &params.id,
        ModelPatch {
            display_name: params.display_name,
            provider: params.provider,
            params: params.params,
        },
    )?;
    notify_settings_changed(ctx, state);
    Ok(json!({}))
}

fn handle_delete_model(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: ModelIdParams = parse_params(params)?;
    state.models.remove(&params.id)?;
    state.metadata.clear(&MetadataScope::Model(params.id.clone()));
    notify_settings_changed(ctx, state);
    info!(model_id = %params.id, "model deleted");
    Ok(json!({}))
}

// ── Users & settings ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NewUserParams {
    username: String,
    credential: String,
    #[serde(default)]
    admin: bool,
}

#[derive(Debug, Deserialize)]
struct UserIdParams {
    id: UserId,
}

#[derive(Debug, Deserialize)]
struct SetAdminSettingsParams {
    settings: AdminSettings,
}

#[derive(Debug, Deserialize)]
struct SetCredentialParams {
    credential: String,
}

async fn handle_new_user(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: NewUserParams = parse_params(params)?;
    let role = if params.admin { UserRole::Admin } else { UserRole::User };
    let id = Arc::clone(&state.users)
        .create_off_thread(params.username, params.credential, role)
        .await?;
    Ok(json!({ "id": id }))
}

fn handle_delete_user(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: UserIdParams = parse_params(params)?;
    if params.id == ctx.owner() {
        return Err(ServiceError::bad_request("admins cannot delete themselves"));
    }
    state.users.delete(params.id)?;

    let closed = state.sessions.disconnect_user(params.id);
    for chat_id in state.chats.remove_owned_by(params.id) {
        state.locks.remove(&chat_id);
        state.metadata.clear(&MetadataScope::Chat(chat_id));
    }
    state.chat_lists.remove(params.id);
    state.metadata.clear(&MetadataScope::User(params.id));
    state.metadata.clear(&MetadataScope::UserPublic(params.id));
    info!(user_id = %params.id, closed_sessions = closed, "user deleted");
    Ok(json!({}))
}

fn handle_set_admin_settings(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    require_admin(ctx)?;
    let params: SetAdminSettingsParams = parse_params(params)?;
    state.models.set_admin_settings(params.settings)?;
    notify_settings_changed(ctx, state);
    Ok(json!({}))
}

async fn handle_set_credential(
    params: Value,
    ctx: &CallContext,
    state: &RpcServerState,
) -> ServiceResult<Value> {
    let params: SetCredentialParams = parse_params(params)?;
    Arc::clone(&state.users).set_credential_off_thread(ctx.owner(), params.credential).await?;
    info!(user_id = %ctx.owner(), "credential changed");
    Ok(json!({}))
}
