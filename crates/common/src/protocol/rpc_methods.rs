// RPC method name constants and their interaction shapes.

// ── Chat list ──────────────────────────────────────────────────────
pub const GET_CHAT_LIST_VERSION: &str = "getChatListVersion";
pub const GET_CHAT_LIST: &str = "getChatList";
pub const NEW_CHAT: &str = "newChat";
pub const DELETE_CHAT: &str = "deleteChat";

// ── Chat ───────────────────────────────────────────────────────────
pub const LOCK_CHAT: &str = "lockChat";
pub const GET_CHAT: &str = "getChat";
pub const SET_CHAT_TITLE: &str = "setChatTitle";
pub const GENERATE_CHAT_TITLE: &str = "generateChatTitle";
pub const CHAT_COMPLETION: &str = "chatCompletion";
pub const ABORT_CHAT_COMPLETION: &str = "abortChatCompletion";
pub const GET_LAST_COMPLETION_INFO: &str = "getLastCompletionInfo";

// ── Metadata ───────────────────────────────────────────────────────
pub const SET_METADATA: &str = "setMetadata";
pub const GET_METADATA: &str = "getMetadata";
pub const DELETE_METADATA: &str = "deleteMetadata";
pub const SET_CHAT_METADATA: &str = "setChatMetadata";
pub const GET_CHAT_METADATA: &str = "getChatMetadata";
pub const DELETE_CHAT_METADATA: &str = "deleteChatMetadata";

// ── Models ─────────────────────────────────────────────────────────
pub const GET_MODELS: &str = "getModels";
pub const NEW_MODEL: &str = "newModel";
pub const GET_MODEL_PARAMS: &str = "getModelParams";
pub const MODIFY_MODEL: &str = "modifyModel";
pub const DELETE_MODEL: &str = "deleteModel";

// ── Users ──────────────────────────────────────────────────────────
pub const GET_USER_INFO: &str = "getUserInfo";
pub const LIST_USERS: &str = "listUsers";
pub const NEW_USER: &str = "newUser";
pub const DELETE_USER: &str = "deleteUser";
pub const GET_ADMIN_SETTINGS: &str = "getAdminSettings";
pub const SET_ADMIN_SETTINGS: &str = "setAdminSettings";
pub const SET_CREDENTIAL: &str = "setCredential";

// ── Server -> client pushes ────────────────────────────────────────
pub const PUSH_CHAT_LIST_VERSION_CHANGED: &str = "chatListVersionChanged";
pub const PUSH_SETTINGS_CHANGED: &str = "settingsChanged";

/// How a method interacts with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Exactly one result or error.
    Call,
    /// Zero or more partial results, then one terminal frame.
    Stream,
    /// Fire-and-forget; never answered.
    Post,
}

/// All client-callable methods with their interaction shape.
pub const METHODS: &[(&str, MethodKind)] = &[
    (GET_CHAT_LIST_VERSION, MethodKind::Call),
    (GET_CHAT_LIST, MethodKind::Call),
    (NEW_CHAT, MethodKind::Call),
    (DELETE_CHAT, MethodKind::Call),
    (LOCK_CHAT, MethodKind::Call),
    (GET_CHAT, MethodKind::Call),
    (SET_CHAT_TITLE, MethodKind::Call),
    (GENERATE_CHAT_TITLE, MethodKind::Call),
    (CHAT_COMPLETION, MethodKind::Stream),
    (ABORT_CHAT_COMPLETION, MethodKind::Post),
    (GET_LAST_COMPLETION_INFO, MethodKind::Call),
    (SET_METADATA, MethodKind::Call),
    (GET_METADATA, MethodKind::Call),
    (DELETE_METADATA, MethodKind::Call),
    (SET_CHAT_METADATA, MethodKind::Call),
    (GET_CHAT_METADATA, MethodKind::Call),
    (DELETE_CHAT_METADATA, MethodKind::Call),
    (GET_MODELS, MethodKind::Call),
    (NEW_MODEL, MethodKind::Call),
    (GET_MODEL_PARAMS, MethodKind::Call),
    (MODIFY_MODEL, MethodKind::Call),
    (DELETE_MODEL, MethodKind::Call),
    (GET_USER_INFO, MethodKind::Call),
    (LIST_USERS, MethodKind::Call),
    (NEW_USER, MethodKind::Call),
    (DELETE_USER, MethodKind::Call),
    (GET_ADMIN_SETTINGS, MethodKind::Call),
    (SET_ADMIN_SETTINGS, MethodKind::Call),
    (SET_CREDENTIAL, MethodKind::Call),
];

/// Methods the server may push without a prior request.
pub const PUSH_METHODS: &[&str] = &[PUSH_CHAT_LIST_VERSION_CHANGED, PUSH_SETTINGS_CHANGED];

#[must_use]
pub fn method_kind(method: &str) -> Option<MethodKind> {
    METHODS.iter().find(|(name, _)| *name == method).map(|(_, kind)| *kind)
}
