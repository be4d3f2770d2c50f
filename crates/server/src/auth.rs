// Authentication seam for WebSocket upgrades.
//
// Clients send `Authorization: Bearer <username>:<credential>`. How the
// credential is checked is up to the `Authenticator`; the default one asks
// the user store.

use std::sync::Arc;

use async_trait::async_trait;
use parley_common::types::{UserId, UserRole};

use crate::store::UserStore;

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub username: String,
    pub role: UserRole,
}

impl UserIdentity {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, credential: &str) -> Option<UserIdentity>;
}

/// Verifies credentials against the argon2 hashes in [`UserStore`].
#[derive(Debug, Clone)]
pub struct StoreAuthenticator {
    users: Arc<UserStore>,
}

impl StoreAuthenticator {
    pub fn new(users: Arc<UserStore>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn authenticate(&self, username: &str, credential: &str) -> Option<UserIdentity> {
        let users = Arc::clone(&self.users);
        let username = username.to_string();
        let credential = credential.to_string();
        // Hash verification is CPU bound.
        tokio::task::spawn_blocking(move || users.verify(&username, &credential))
            .await
            .ok()
            .flatten()
    }
}

/// Split a `Bearer <username>:<credential>` header value.
pub fn extract_bearer_credentials(value: &str) -> Option<(&str, &str)> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let (username, credential) = token.trim().split_once(':')?;
    if username.is_empty() || credential.is_empty() {
        return None;
    }

    Some((username, credential))
}
