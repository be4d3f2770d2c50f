// Per-chat exclusive locks held by sessions.
//
// - at most one session holds a chat at a time
// - `lock` by another session evicts the holder unless a stream is running
// - while a stream runs, even the holder's own mutations fail with LOCKED
// - the streaming flag belongs to the holder that set it; a guard dropped
//   after the lock changed hands leaves the new holder untouched

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use parley_common::protocol::errors::ErrorCode;
use parley_common::types::{ChatId, SessionId};
use tracing::{debug, info};

use super::{lock_guard, read_guard, write_guard};
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    Held { holder: SessionId, streaming: bool },
}

impl LockState {
    pub fn holder(&self) -> Option<SessionId> {
        match self {
            Self::Unlocked => None,
            Self::Held { holder, .. } => Some(*holder),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Held { streaming: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOutcome {
    /// The caller already held the lock before this call.
    pub already_held: bool,
    /// Session that lost the lock to the caller, if any.
    pub evicted: Option<SessionId>,
}

type LockSlot = Arc<Mutex<LockState>>;

#[derive(Debug, Default)]
pub struct ChatLockManager {
    slots: RwLock<HashMap<ChatId, LockSlot>>,
}

impl ChatLockManager {
    fn slot(&self, chat_id: &str) -> LockSlot {
        if let Some(slot) = read_guard(&self.slots).get(chat_id) {
            return Arc::clone(slot);
        }
        Arc::clone(write_guard(&self.slots).entry(chat_id.to_string()).or_default())
    }

    fn existing_slot(&self, chat_id: &str) -> Option<LockSlot> {
        read_guard(&self.slots).get(chat_id).cloned()
    }

    pub fn state(&self, chat_id: &str) -> LockState {
        self.existing_slot(chat_id).map(|slot| *lock_guard(&slot)).unwrap_or_default()
    }

    /// Take the chat lock for `session`, evicting an idle holder.
    pub fn lock(&self, chat_id: &str, session: SessionId) -> ServiceResult<LockOutcome> {
        let slot = self.slot(chat_id);
        let mut state = lock_guard(&slot);
        match *state {
            LockState::Held { holder, .. } if holder == session => {
                Ok(LockOutcome { already_held: true, evicted: None })
            }
            LockState::Held { streaming: true, .. } => Err(ServiceError::from_code(ErrorCode::Locked)),
            LockState::Held { holder, streaming: false } => {
                *state = LockState::Held { holder: session, streaming: false };
                info!(chat_id, %session, evicted = %holder, "chat lock taken over");
                Ok(LockOutcome { already_held: false, evicted: Some(holder) })
            }
            LockState::Unlocked => {
                *state = LockState::Held { holder: session, streaming: false };
                debug!(chat_id, %session, "chat lock acquired");
                Ok(LockOutcome { already_held: false, evicted: None })
            }
        }
    }

    /// Fail with LOCK_NOT_HELD unless `session` holds the chat.
    pub fn require_holder(&self, chat_id: &str, session: SessionId) -> ServiceResult<()> {
        check_holder(&self.state(chat_id), session)
    }

    /// Like [`Self::require_holder`], and additionally LOCKED while streaming.
    pub fn require_idle_holder(&self, chat_id: &str, session: SessionId) -> ServiceResult<()> {
        check_idle_holder(&self.state(chat_id), session)
    }

    /// Run `apply` while the chat lock slot is pinned to `session` as an
    /// idle holder. Nobody can take over the lock until `apply` returns.
    pub fn with_held<R>(
        &self,
        chat_id: &str,
        session: SessionId,
        apply: impl FnOnce() -> ServiceResult<R>,
    ) -> ServiceResult<R> {
        let slot = self.existing_slot(chat_id).ok_or_else(lock_not_held)?;
        let state = lock_guard(&slot);
        check_idle_holder(&state, session)?;
        apply()
    }

    /// Mark the chat as streaming for its holder. The flag clears when the
    /// returned guard drops.
    pub fn begin_streaming(
        self: &Arc<Self>,
        chat_id: &str,
        session: SessionId,
    ) -> ServiceResult<StreamingGuard> {
        let slot = self.existing_slot(chat_id).ok_or_else(lock_not_held)?;
        let mut state = lock_guard(&slot);
        check_idle_holder(&state, session)?;
        *state = LockState::Held { holder: session, streaming: true };
        debug!(chat_id, %session, "chat streaming started");
        Ok(StreamingGuard { slot: Arc::clone(&slot), chat_id: chat_id.to_string(), session })
    }

    /// Drop every lock `session` holds. Returns the released chats.
    pub fn release_session(&self, session: SessionId) -> Vec<ChatId> {
        let slots: Vec<(ChatId, LockSlot)> = read_guard(&self.slots)
            .iter()
            .map(|(chat_id, slot)| (chat_id.clone(), Arc::clone(slot)))
            .collect();

        let mut released = Vec::new();
        for (chat_id, slot) in slots {
            let mut state = lock_guard(&slot);
            if state.holder() == Some(session) {
                *state = LockState::Unlocked;
                released.push(chat_id);
            }
        }
        released.sort();
        if !released.is_empty() {
            debug!(%session, count = released.len(), "released chat locks");
        }
        released
    }

    pub fn remove(&self, chat_id: &str) {
        write_guard(&self.slots).remove(chat_id);
    }
}

fn lock_not_held() -> ServiceError {
    ServiceError::from_code(ErrorCode::LockNotHeld)
}

fn check_holder(state: &LockState, session: SessionId) -> ServiceResult<()> {
    if state.holder() == Some(session) {
        Ok(())
    } else {
        Err(lock_not_held())
    }
}

fn check_idle_holder(state: &LockState, session: SessionId) -> ServiceResult<()> {
    check_holder(state, session)?;
    if state.is_streaming() {
        return Err(ServiceError::from_code(ErrorCode::Locked));
    }
    Ok(())
}

/// Streaming marker for one chat. Dropping it ends the stream.
#[derive(Debug)]
pub struct StreamingGuard {
    slot: LockSlot,
    chat_id: ChatId,
    session: SessionId,
}

impl StreamingGuard {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }
}

impl Drop for StreamingGuard {
    fn drop(&mut self) {
        let mut state = lock_guard(&self.slot);
        if let LockState::Held { holder, streaming: true } = *state {
            if holder == self.session {
                *state = LockState::Held { holder, streaming: false };
                debug!(chat_id = %self.chat_id, session = %self.session, "chat streaming ended");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_common::protocol::errors::ErrorCode;
    use uuid::Uuid;

    use super::{ChatLockManager, LockOutcome, LockState};

    #[test]
    fn lock_is_idempotent_for_holder() {
        let locks = ChatLockManager::default();
        let session = Uuid::new_v4();

        assert_eq!(
            locks.lock("c1", session).unwrap(),
            LockOutcome { already_held: false, evicted: None }
        );
        assert_eq!(
            locks.lock("c1", session).unwrap(),
            LockOutcome { already_held: true, evicted: None }
        );
        locks.require_holder("c1", session).unwrap();
    }

    #[test]
    fn second_session_evicts_idle_holder() {
        let locks = ChatLockManager::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        locks.lock("c1", first).unwrap();

        let outcome = locks.lock("c1", second).unwrap();
        assert_eq!(outcome.evicted, Some(first));
        assert_eq!(
            locks.require_holder("c1", first).unwrap_err().code(),
            ErrorCode::LockNotHeld
        );
        assert_eq!(locks.state("c1").holder(), Some(second));
    }

    #[test]
    fn streaming_blocks_takeover_and_holder_mutations() {
        let locks = Arc::new(ChatLockManager::default());
        let holder = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        locks.lock("c1", holder).unwrap();

        let guard = locks.begin_streaming("c1", holder).unwrap();
        assert_eq!(locks.lock("c1", intruder).unwrap_err().code(), ErrorCode::Locked);
        assert_eq!(
            locks.require_idle_holder("c1", holder).unwrap_err().code(),
            ErrorCode::Locked
        );
        assert_eq!(
            locks.with_held("c1", holder, || Ok(())).unwrap_err().code(),
            ErrorCode::Locked
        );
        locks.require_holder("c1", holder).unwrap();

        drop(guard);
        assert_eq!(locks.state("c1"), LockState::Held { holder, streaming: false });
        assert_eq!(locks.lock("c1", intruder).unwrap().evicted, Some(holder));
    }

    #[test]
    fn stale_guard_does_not_touch_new_holder() {
        let locks = Arc::new(ChatLockManager::default());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        locks.lock("c1", first).unwrap();
        let guard = locks.begin_streaming("c1", first).unwrap();

        locks.release_session(first);
        locks.lock("c1", second).unwrap();
        let second_guard = locks.begin_streaming("c1", second).unwrap();
        drop(guard);

        assert_eq!(locks.state("c1"), LockState::Held { holder: second, streaming: true });
        drop(second_guard);
    }

    #[test]
    fn unlocked_chat_rejects_writes_and_streams() {
        let locks = Arc::new(ChatLockManager::default());
        let session = Uuid::new_v4();

        assert_eq!(locks.require_holder("c9", session).unwrap_err().code(), ErrorCode::LockNotHeld);
        assert_eq!(
            locks.begin_streaming("c9", session).unwrap_err().code(),
            ErrorCode::LockNotHeld
        );
        assert_eq!(locks.state("c9"), LockState::Unlocked);
    }

    #[test]
    fn release_session_frees_only_its_chats() {
        let locks = ChatLockManager::default();
        let leaving = Uuid::new_v4();
        let staying = Uuid::new_v4();
        locks.lock("a", leaving).unwrap();
        locks.lock("b", leaving).unwrap();
        locks.lock("c", staying).unwrap();

        assert_eq!(locks.release_session(leaving), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(locks.state("a"), LockState::Unlocked);
        assert_eq!(locks.state("c").holder(), Some(staying));
    }
}
