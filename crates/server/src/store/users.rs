// User accounts with argon2-hashed credentials.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use parley_common::protocol::errors::ErrorCode;
use parley_common::types::{UserId, UserInfo, UserRole};
use tracing::info;
use uuid::Uuid;

use crate::auth::UserIdentity;
use crate::error::{ServiceError, ServiceResult};
use crate::sync::{read_guard, write_guard};

#[derive(Debug, Clone)]
struct UserRecord {
    id: UserId,
    username: String,
    role: UserRole,
    credential_hash: String,
}

impl UserRecord {
    fn identity(&self) -> UserIdentity {
        UserIdentity { user_id: self.id, username: self.username.clone(), role: self.role }
    }
}

#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl UserStore {
    pub fn create(&self, username: &str, credential: &str, role: UserRole) -> ServiceResult<UserId> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServiceError::bad_request("username must not be empty"));
        }
        if username.contains(':') {
            return Err(ServiceError::bad_request("username must not contain `:`"));
        }
        let credential_hash = hash_credential(credential)?;

        let mut users = write_guard(&self.users);
        if users.values().any(|user| user.username == username) {
            return Err(ServiceError::new(
                ErrorCode::Conflict,
                format!("username `{username}` is already taken"),
            ));
        }
        let id = Uuid::new_v4();
        users.insert(
            id,
            UserRecord { id, username: username.to_string(), role, credential_hash },
        );
        info!(user_id = %id, username, admin = role.is_admin(), "user created");
        Ok(id)
    }

    pub fn delete(&self, user_id: UserId) -> ServiceResult<()> {
        write_guard(&self.users)
            .remove(&user_id)
            .map(|_| ())
            .ok_or_else(|| ServiceError::not_found("user", user_id))
    }

    pub fn get(&self, user_id: UserId) -> ServiceResult<UserInfo> {
        read_guard(&self.users)
            .get(&user_id)
            .map(user_info)
            .ok_or_else(|| ServiceError::not_found("user", user_id))
    }

    pub fn find_by_username(&self, username: &str) -> Option<UserIdentity> {
        read_guard(&self.users)
            .values()
            .find(|user| user.username == username)
            .map(UserRecord::identity)
    }

    /// All users ordered by username.
    pub fn list(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = read_guard(&self.users).values().map(user_info).collect();
        users.sort_by(|left, right| left.username.cmp(&right.username));
        users
    }

    pub fn set_credential(&self, user_id: UserId, credential: &str) -> ServiceResult<()> {
        let credential_hash = hash_credential(credential)?;
        let mut users = write_guard(&self.users);
        let user = users.get_mut(&user_id).ok_or_else(|| ServiceError::not_found("user", user_id))?;
        user.credential_hash = credential_hash;
        Ok(())
    }

    /// [`Self::create`] on the blocking pool, for callers on the runtime.
    pub async fn create_off_thread(
        self: Arc<Self>,
        username: String,
        credential: String,
        role: UserRole,
    ) -> ServiceResult<UserId> {
        off_thread(move || self.create(&username, &credential, role)).await
    }

    /// [`Self::set_credential`] on the blocking pool.
    pub async fn set_credential_off_thread(
        self: Arc<Self>,
        user_id: UserId,
        credential: String,
    ) -> ServiceResult<()> {
        off_thread(move || self.set_credential(user_id, &credential)).await
    }

    /// Check a username/credential pair. Unknown users and wrong
    /// credentials are indistinguishable to the caller.
    pub fn verify(&self, username: &str, credential: &str) -> Option<UserIdentity> {
        let (identity, stored_hash) = {
            let users = read_guard(&self.users);
            let user = users.values().find(|user| user.username == username)?;
            (user.identity(), user.credential_hash.clone())
        };
        let parsed = PasswordHash::new(&stored_hash).ok()?;
        Argon2::default().verify_password(credential.as_bytes(), &parsed).ok()?;
        Some(identity)
    }
}

fn user_info(user: &UserRecord) -> UserInfo {
    UserInfo { id: user.id, username: user.username.clone(), admin: user.role.is_admin() }
}

// Argon2 hashing is CPU bound.
async fn off_thread<T, F>(work: F) -> ServiceResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| ServiceError::internal(format!("credential task failed: {error}")))?
}

fn hash_credential(credential: &str) -> ServiceResult<String> {
    if credential.is_empty() {
        return Err(ServiceError::bad_request("credential must not be empty"));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(credential.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| ServiceError::internal(format!("failed to hash credential: {error}")))
}
