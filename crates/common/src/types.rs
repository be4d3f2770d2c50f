// Core domain types shared by the server and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type ChatId = String;
pub type NodeId = String;
pub type ModelId = String;
pub type UserId = Uuid;
pub type SessionId = Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    #[default]
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// One node of a chat's message tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: NodeId,
    pub message: Message,
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

/// Display metadata for one chat in a user's chat list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatListEntry {
    pub id: ChatId,
    pub title: String,
    pub timestamp: DateTime<Utc>,
}

/// Public view of a configured model. Provider parameters are never part
/// of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: ModelId,
    pub display_name: String,
    pub provider: String,
}

/// Full model configuration, including opaque provider parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: ModelId,
    pub display_name: String,
    pub provider: String,
    #[serde(default)]
    pub params: Value,
}

impl ModelConfig {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            provider: self.provider.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub admin: bool,
}

/// Server-wide settings only admins may read or change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminSettings {
    /// Model used by `generateChatTitle` when the caller names none.
    pub title_model_id: Option<ModelId>,
    /// Model clients should preselect for new chats.
    pub default_model_id: Option<ModelId>,
}

/// Phases of one chat completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPhase {
    Init,
    Locked,
    AppendingUser,
    Generating,
    AppendingAssistant,
    Completed,
    Aborted,
}

impl CompletionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Summary of the most recent completion run on a chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionInfo {
    pub model_id: ModelId,
    pub phase: CompletionPhase,
    pub user_message_id: NodeId,
    pub assistant_message_id: Option<NodeId>,
    pub token_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
