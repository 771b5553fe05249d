use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    unix_now, FollowStore, RefreshRecord, TokenStore, UserRecord, UserStore, IN_MEMORY,
};
use crate::error::StorageError;
use crate::models::UserId;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    users: BTreeMap<u64, UserRecord>,
    follows: BTreeSet<(UserId, UserId)>,
    refresh_tokens: HashMap<String, RefreshRecord>,
}

impl Tables {
    fn require_user(&self, id: UserId) -> Result<&UserRecord, StorageError> {
        self.users.get(&id.0).ok_or(StorageError::UserNotFound(id))
    }

    fn records(&self, ids: impl IntoIterator<Item = UserId>) -> Vec<UserRecord> {
        ids.into_iter()
            .filter_map(|id| self.users.get(&id.0).cloned())
            .collect()
    }
}

/// Shared store backing every capability.
///
/// All tables sit behind a single lock. When opened on a file path, every mutation is applied
/// to a copy of the tables, written to the JSON snapshot, and only then installed, all before
/// the lock is released. A failed write leaves both the file and the tables as they were.
#[derive(Clone)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
    snapshot: Option<PathBuf>,
}

impl MemoryStorage {
    /// Creates an empty store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            snapshot: None,
        }
    }

    /// Opens the store at `location`.
    ///
    /// [`IN_MEMORY`] selects a store without a snapshot. Any other value is the path of a JSON
    /// snapshot: an existing file is loaded, a missing one is created. A missing parent
    /// directory makes the location unreachable.
    pub async fn open(location: &str) -> Result<Self, StorageError> {
        if location == IN_MEMORY {
            return Ok(Self::in_memory());
        }

        let path = PathBuf::from(location);
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let tables: Tables = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    users = tables.users.len(),
                    "loaded storage snapshot"
                );
                tables
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let parent_exists = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => {
                        tokio::fs::metadata(parent).await.is_ok_and(|m| m.is_dir())
                    }
                    _ => true,
                };
                if !parent_exists {
                    return Err(StorageError::Unreachable(location.to_string()));
                }

                let tables = Tables::default();
                write_snapshot(&path, &tables).await?;
                info!(path = %path.display(), "created storage snapshot");
                tables
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            snapshot: Some(path),
        })
    }

    /// Path of the snapshot file, if any.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Returns the number of registered users.
    pub async fn user_count(&self) -> usize {
        self.tables.read().await.users.len()
    }

    /// Returns the number of live refresh tokens.
    pub async fn refresh_token_count(&self) -> usize {
        self.tables.read().await.refresh_tokens.len()
    }

    /// Runs `change` under the write lock. `change` reports whether it modified the tables;
    /// modified tables are written to the snapshot before they replace the current ones.
    async fn commit<T, F>(&self, change: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnOnce(&mut Tables) -> Result<(T, bool), StorageError> + Send,
    {
        let mut tables = self.tables.write().await;
        let Some(path) = &self.snapshot else {
            return change(&mut *tables).map(|(value, _)| value);
        };

        let mut next = tables.clone();
        let (value, changed) = change(&mut next)?;
        if changed {
            write_snapshot(path, &next).await?;
            *tables = next;
        }
        Ok(value)
    }
}

async fn write_snapshot(path: &Path, tables: &Tables) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(tables)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "storage snapshot written");
    Ok(())
}

#[async_trait]
impl UserStore for MemoryStorage {
    async fn insert_user(
        &self,
        login: &str,
        email: &str,
        password_digest: &str,
    ) -> Result<UserRecord, StorageError> {
        self.commit(|tables| {
            if tables.users.values().any(|user| user.login == login) {
                return Err(StorageError::UserExists);
            }

            tables.next_id += 1;
            let record = UserRecord {
                id: UserId(tables.next_id),
                login: login.to_string(),
                email: email.to_string(),
                password_digest: password_digest.to_string(),
                registered_at: unix_now(),
            };
            tables.users.insert(record.id.0, record.clone());
            Ok((record, true))
        })
        .await
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.tables.read().await.users.get(&id.0).cloned())
    }

    async fn user_by_login(&self, login: &str) -> Result<Option<UserRecord>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.login == login).cloned())
    }

    async fn users_by_ids(&self, ids: &BTreeSet<UserId>) -> Result<Vec<UserRecord>, StorageError> {
        Ok(self.tables.read().await.records(ids.iter().copied()))
    }

    async fn search_logins(&self, query: &str) -> Result<Vec<UserRecord>, StorageError> {
        let needle = query.to_lowercase();
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .filter(|u| u.login.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TokenStore for MemoryStorage {
    async fn save_refresh_token(
        &self,
        token: &str,
        record: RefreshRecord,
    ) -> Result<(), StorageError> {
        self.commit(|tables| {
            tables.refresh_tokens.insert(token.to_string(), record);
            Ok(((), true))
        })
        .await
    }

    async fn take_refresh_token(&self, token: &str) -> Result<Option<RefreshRecord>, StorageError> {
        self.commit(|tables| {
            let record = tables.refresh_tokens.remove(token);
            let taken = record.is_some();
            Ok((record, taken))
        })
        .await
    }

    async fn purge_expired_tokens(&self, now: u64) -> Result<usize, StorageError> {
        self.commit(|tables| {
            let before = tables.refresh_tokens.len();
            tables.refresh_tokens.retain(|_, record| !record.is_expired(now));
            let purged = before - tables.refresh_tokens.len();
            Ok((purged, purged > 0))
        })
        .await
    }
}

#[async_trait]
impl FollowStore for MemoryStorage {
    async fn add_follow(&self, source: UserId, target: UserId) -> Result<bool, StorageError> {
        self.commit(|tables| {
            tables.require_user(source)?;
            tables.require_user(target)?;

            let inserted = tables.follows.insert((source, target));
            Ok((inserted, inserted))
        })
        .await
    }

    async fn remove_follow(&self, source: UserId, target: UserId) -> Result<bool, StorageError> {
        self.commit(|tables| {
            tables.require_user(source)?;
            tables.require_user(target)?;

            let removed = tables.follows.remove(&(source, target));
            Ok((removed, removed))
        })
        .await
    }

    async fn followers(&self, id: UserId) -> Result<Vec<UserRecord>, StorageError> {
        let tables = self.tables.read().await;
        tables.require_user(id)?;

        let sources = tables
            .follows
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(source, _)| *source)
            .collect::<BTreeSet<_>>();
        Ok(tables.records(sources))
    }

    async fn followees(&self, id: UserId) -> Result<Vec<UserRecord>, StorageError> {
        let tables = self.tables.read().await;
        tables.require_user(id)?;

        let targets = tables
            .follows
            .range((id, UserId(0))..=(id, UserId(u64::MAX)))
            .map(|(_, target)| *target);
        Ok(tables.records(targets))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::in_memory()
    }
}
