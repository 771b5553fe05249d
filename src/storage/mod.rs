use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::models::{User, UserId};

/// In-memory tables with an optional JSON snapshot.
pub mod memory;

pub use memory::MemoryStorage;

/// Location string selecting a purely in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Stored user row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    /// Storage-assigned identifier.
    pub id: UserId,
    /// Unique login.
    pub login: String,
    /// Contact email.
    pub email: String,
    /// Hex-encoded password digest.
    pub password_digest: String,
    /// Unix timestamp of registration.
    pub registered_at: u64,
}

impl UserRecord {
    /// Public view of the row.
    pub fn to_user(&self) -> User {
        User {
            id: self.id,
            login: self.login.clone(),
            email: self.email.clone(),
        }
    }
}

/// Stored refresh token metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    /// Owner of the token.
    pub user_id: UserId,
    /// Unix timestamp after which the token is rejected.
    pub expires_at: u64,
}

impl RefreshRecord {
    /// Checks if the token has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// User rows.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Inserts a user, assigning the next id. Fails with `UserExists` on a taken login.
    async fn insert_user(
        &self,
        login: &str,
        email: &str,
        password_digest: &str,
    ) -> Result<UserRecord, StorageError>;

    /// Fetches a user by id.
    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StorageError>;

    /// Fetches a user by exact login.
    async fn user_by_login(&self, login: &str) -> Result<Option<UserRecord>, StorageError>;

    /// Fetches the existing users among `ids`, ordered by id.
    async fn users_by_ids(&self, ids: &BTreeSet<UserId>) -> Result<Vec<UserRecord>, StorageError>;

    /// Users whose login contains `query` (case-insensitive), ordered by id.
    async fn search_logins(&self, query: &str) -> Result<Vec<UserRecord>, StorageError>;
}

/// Refresh tokens.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Stores a freshly issued refresh token.
    async fn save_refresh_token(
        &self,
        token: &str,
        record: RefreshRecord,
    ) -> Result<(), StorageError>;

    /// Removes and returns a refresh token.
    async fn take_refresh_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError>;

    /// Drops every token expired at `now`, returning how many were removed.
    async fn purge_expired_tokens(&self, now: u64) -> Result<usize, StorageError>;
}

/// Follow edges.
#[async_trait]
pub trait FollowStore: Send + Sync + 'static {
    /// Adds the `source` → `target` edge. Returns false when it already existed.
    async fn add_follow(&self, source: UserId, target: UserId) -> Result<bool, StorageError>;

    /// Removes the `source` → `target` edge. Returns false when it did not exist.
    async fn remove_follow(&self, source: UserId, target: UserId) -> Result<bool, StorageError>;

    /// Users following `id`, ordered by id.
    async fn followers(&self, id: UserId) -> Result<Vec<UserRecord>, StorageError>;

    /// Users followed by `id`, ordered by id.
    async fn followees(&self, id: UserId) -> Result<Vec<UserRecord>, StorageError>;
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| unreachable!("System time is after UNIX_EPOCH"))
        .as_secs()
}
