use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::capability::{CallContext, UserDirectory};
use crate::error::ServiceError;
use crate::models::{User, UserId};
use crate::storage::{UserRecord, UserStore};

/// Reference [`UserDirectory`] backed by a user store.
pub struct UserInfoService<S> {
    storage: Arc<S>,
}

impl<S: UserStore> UserInfoService<S> {
    /// Creates the service on top of `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

fn to_users(records: Vec<UserRecord>) -> Vec<User> {
    records.iter().map(UserRecord::to_user).collect()
}

#[async_trait]
impl<S: UserStore> UserDirectory for UserInfoService<S> {
    async fn user(&self, _ctx: &CallContext, id: UserId) -> Result<User, ServiceError> {
        self.storage
            .user_by_id(id)
            .await?
            .map(|record| record.to_user())
            .ok_or(ServiceError::UserNotFound(id))
    }

    async fn users(
        &self,
        _ctx: &CallContext,
        ids: BTreeSet<UserId>,
    ) -> Result<Vec<User>, ServiceError> {
        let records = self.storage.users_by_ids(&ids).await?;

        if records.len() != ids.len() {
            let found = records.iter().map(|r| r.id).collect::<BTreeSet<_>>();
            if let Some(missing) = ids.difference(&found).next() {
                return Err(ServiceError::UserNotFound(*missing));
            }
        }

        Ok(to_users(records))
    }

    async fn users_exist(
        &self,
        _ctx: &CallContext,
        ids: BTreeSet<UserId>,
    ) -> Result<bool, ServiceError> {
        let records = self.storage.users_by_ids(&ids).await?;
        Ok(records.len() == ids.len())
    }

    async fn users_by_login(
        &self,
        _ctx: &CallContext,
        query: String,
    ) -> Result<Vec<User>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "login query cannot be empty".to_string(),
            ));
        }

        let records = self.storage.search_logins(query).await?;
        debug!(op = "userinfo.users_by_login", query, matches = records.len());
        Ok(to_users(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    async fn service() -> UserInfoService<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::in_memory());
        for login in ["alice", "bob", "alina"] {
            storage
                .insert_user(login, &format!("{login}@example.com"), "digest")
                .await
                .unwrap();
        }
        UserInfoService::new(storage)
    }

    fn ids(ids: &[u64]) -> BTreeSet<UserId> {
        ids.iter().copied().map(UserId).collect()
    }

    #[tokio::test]
    async fn user_lookup() {
        let svc = service().await;
        let ctx = CallContext::new();

        let bob = svc.user(&ctx, UserId(2)).await.unwrap();
        assert_eq!(bob.login, "bob");
        assert_eq!(bob.email, "bob@example.com");

        let err = svc.user(&ctx, UserId(9)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound(UserId(9))));
    }

    #[tokio::test]
    async fn users_are_ordered_and_complete() {
        let svc = service().await;
        let ctx = CallContext::new();

        let users = svc.users(&ctx, ids(&[3, 1])).await.unwrap();
        assert_eq!(
            users.iter().map(|u| u.login.as_str()).collect::<Vec<_>>(),
            vec!["alice", "alina"]
        );

        let err = svc.users(&ctx, ids(&[1, 5, 6])).await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound(UserId(5))));
    }

    #[tokio::test]
    async fn existence_requires_every_id() {
        let svc = service().await;
        let ctx = CallContext::new();

        assert!(svc.users_exist(&ctx, ids(&[1, 2, 3])).await.unwrap());
        assert!(!svc.users_exist(&ctx, ids(&[1, 4])).await.unwrap());
        assert!(svc.users_exist(&ctx, BTreeSet::new()).await.unwrap());
    }

    #[tokio::test]
    async fn login_search() {
        let svc = service().await;
        let ctx = CallContext::new();

        let found = svc.users_by_login(&ctx, "ali".into()).await.unwrap();
        assert_eq!(found.len(), 2);

        let exact = svc.users_by_login(&ctx, "bob".into()).await.unwrap();
        assert_eq!(exact[0].id, UserId(2));

        let err = svc.users_by_login(&ctx, "  ".into()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }
}
