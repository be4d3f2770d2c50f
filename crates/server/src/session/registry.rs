// Live session registry and server -> client push fan-out.
//
// A session exists exactly as long as its connection. Pushes are queued on
// the session's unbounded outbound channel; the connection assigns the wire
// id when it writes the frame.

use std::collections::HashMap;
use std::sync::RwLock;

use parley_common::protocol::push::Push;
use parley_common::protocol::rpc::ServerMessage;
use parley_common::types::{SessionId, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::sync::read_guard;
use crate::sync::write_guard;

/// One frame queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Push(Push),
}

/// Registration handle returned to the connection that owns the session.
#[derive(Debug, Clone)]
pub struct SessionRegistration {
    pub session_id: SessionId,
    /// Cancelled when the server wants the connection closed.
    pub closed: CancellationToken,
}

#[derive(Debug)]
struct SessionEntry {
    user_id: UserId,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn register(
        &self,
        user_id: UserId,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> SessionRegistration {
        let session_id = Uuid::new_v4();
        let closed = CancellationToken::new();
        write_guard(&self.sessions)
            .insert(session_id, SessionEntry { user_id, outbound, closed: closed.clone() });
        debug!(%session_id, %user_id, "session registered");
        SessionRegistration { session_id, closed }
    }

    pub fn unregister(&self, session_id: SessionId) -> bool {
        let removed = write_guard(&self.sessions).remove(&session_id).is_some();
        if removed {
            debug!(%session_id, "session unregistered");
        }
        removed
    }

    /// Push to every live session of `user_id` except `exclude`.
    pub fn notify_user(&self, user_id: UserId, exclude: Option<SessionId>, push: Push) -> usize {
        self.fan_out(push, |session_id, entry| {
            entry.user_id == user_id && Some(session_id) != exclude
        })
    }

    /// Push to every live session except `exclude`.
    pub fn notify_all(&self, exclude: Option<SessionId>, push: Push) -> usize {
        self.fan_out(push, |session_id, _| Some(session_id) != exclude)
    }

    /// Ask every connection of `user_id` to close.
    pub fn disconnect_user(&self, user_id: UserId) -> usize {
        let guard = read_guard(&self.sessions);
        let mut closed = 0;
        for entry in guard.values().filter(|entry| entry.user_id == user_id) {
            entry.closed.cancel();
            closed += 1;
        }
        closed
    }

    /// Ask every connection to close, e.g. on shutdown.
    pub fn close_all(&self) -> usize {
        let guard = read_guard(&self.sessions);
        for entry in guard.values() {
            entry.closed.cancel();
        }
        guard.len()
    }

    fn fan_out<F>(&self, push: Push, include: F) -> usize
    where
        F: Fn(SessionId, &SessionEntry) -> bool,
    {
        let recipients: Vec<mpsc::UnboundedSender<Outbound>> = read_guard(&self.sessions)
            .iter()
            .filter(|(session_id, entry)| include(**session_id, entry))
            .map(|(_, entry)| entry.outbound.clone())
            .collect();

        let mut sent_count = 0;
        for recipient in recipients {
            if recipient.send(Outbound::Push(push.clone())).is_ok() {
                sent_count += 1;
            }
        }
        sent_count
    }
}
