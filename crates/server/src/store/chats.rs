// In-memory chat records and the per-user chat list aggregate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use parley_common::history::TreeHistory;
use parley_common::types::{ChatId, ChatListEntry, CompletionInfo, UserId};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::sync::{lock_guard, read_guard, write_guard};

pub const DEFAULT_CHAT_TITLE: &str = "New chat";

/// Full state of one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub owner: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: TreeHistory,
    pub last_completion: Option<CompletionInfo>,
}

impl ChatRecord {
    pub fn new(owner: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            title: DEFAULT_CHAT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            history: TreeHistory::new(),
            last_completion: None,
        }
    }

    pub fn list_entry(&self) -> ChatListEntry {
        ChatListEntry { id: self.id.clone(), title: self.title.clone(), timestamp: self.updated_at }
    }

    pub fn view(&self) -> ChatView<'_> {
        ChatView {
            id: &self.id,
            title: &self.title,
            created_at: self.created_at,
            updated_at: self.updated_at,
            history: &self.history,
        }
    }
}

/// Wire shape returned by `getChat`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: &'a TreeHistory,
}

/// A user's chat list: the versioned aggregate behind `getChatList`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatList {
    entries: BTreeMap<ChatId, ChatListEntry>,
}

impl ChatList {
    pub fn upsert(&mut self, entry: ChatListEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, chat_id: &str) -> Option<ChatListEntry> {
        self.entries.remove(chat_id)
    }

    pub fn contains(&self, chat_id: &str) -> bool {
        self.entries.contains_key(chat_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries with the most recently active chat first.
    pub fn entries(&self) -> Vec<ChatListEntry> {
        let mut entries: Vec<ChatListEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|left, right| {
            right.timestamp.cmp(&left.timestamp).then_with(|| left.id.cmp(&right.id))
        });
        entries
    }
}

type ChatSlot = Arc<Mutex<ChatRecord>>;

#[derive(Debug, Default)]
pub struct ChatStore {
    chats: RwLock<HashMap<ChatId, ChatSlot>>,
}

impl ChatStore {
    /// Look up a chat owned by `owner`. Chats of other users are reported as
    /// missing so their ids leak nothing.
    fn slot(&self, owner: UserId, chat_id: &str) -> ServiceResult<ChatSlot> {
        let slot = read_guard(&self.chats)
            .get(chat_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("chat", chat_id))?;
        if lock_guard(&slot).owner != owner {
            return Err(ServiceError::not_found("chat", chat_id));
        }
        Ok(slot)
    }

    pub fn exists(&self, owner: UserId, chat_id: &str) -> bool {
        self.slot(owner, chat_id).is_ok()
    }

    pub fn snapshot(&self, owner: UserId, chat_id: &str) -> ServiceResult<ChatRecord> {
        let slot = self.slot(owner, chat_id)?;
        let record = lock_guard(&slot).clone();
        Ok(record)
    }

    pub fn with_chat<R>(
        &self,
        owner: UserId,
        chat_id: &str,
        apply: impl FnOnce(&mut ChatRecord) -> ServiceResult<R>,
    ) -> ServiceResult<R> {
        let slot = self.slot(owner, chat_id)?;
        let mut record = lock_guard(&slot);
        apply(&mut record)
    }

    pub fn insert(&self, record: ChatRecord) {
        write_guard(&self.chats).insert(record.id.clone(), Arc::new(Mutex::new(record)));
    }

    pub fn remove(&self, owner: UserId, chat_id: &str) -> ServiceResult<ChatRecord> {
        self.slot(owner, chat_id)?;
        let slot = write_guard(&self.chats)
            .remove(chat_id)
            .ok_or_else(|| ServiceError::not_found("chat", chat_id))?;
        let record = lock_guard(&slot).clone();
        Ok(record)
    }

    /// Drop every chat of `owner`, returning the removed ids.
    pub fn remove_owned_by(&self, owner: UserId) -> Vec<ChatId> {
        let mut chats = write_guard(&self.chats);
        let owned: Vec<ChatId> = chats
            .iter()
            .filter(|(_, slot)| lock_guard(slot).owner == owner)
            .map(|(chat_id, _)| chat_id.clone())
            .collect();
        for chat_id in &owned {
            chats.remove(chat_id);
        }
        owned
    }

    pub fn len(&self) -> usize {
        read_guard(&self.chats).len()
    }
}
