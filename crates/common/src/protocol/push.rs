// Server -> client push notifications.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::rpc_methods::{PUSH_CHAT_LIST_VERSION_CHANGED, PUSH_SETTINGS_CHANGED};

/// Unsolicited notifications that tell a session to resync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Push {
    /// The owning user's chat list moved to `version`.
    ChatListVersionChanged { version: u64 },
    /// Models or admin settings changed; refetch them.
    SettingsChanged,
}

impl Push {
    pub fn method(&self) -> &'static str {
        match self {
            Self::ChatListVersionChanged { .. } => PUSH_CHAT_LIST_VERSION_CHANGED,
            Self::SettingsChanged => PUSH_SETTINGS_CHANGED,
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::ChatListVersionChanged { version } => json!({ "version": version }),
            Self::SettingsChanged => json!({}),
        }
    }

    /// Rebuild a push from a received `{method, params}` pair.
    pub fn decode(method: &str, params: &Value) -> Option<Self> {
        match method {
            PUSH_CHAT_LIST_VERSION_CHANGED => {
                params.get("version").and_then(Value::as_u64).map(|version| {
                    Self::ChatListVersionChanged { version }
                })
            }
            PUSH_SETTINGS_CHANGED => Some(Self::SettingsChanged),
            _ => None,
        }
    }
}
