use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capability::{CallContext, FollowGraph};
use crate::error::ServiceError;
use crate::models::{User, UserId};
use crate::storage::{FollowStore, UserRecord};

/// Reference [`FollowGraph`] backed by a follow store.
///
/// Following twice or unfollowing a missing edge succeeds without change.
pub struct FollowService<S> {
    storage: Arc<S>,
}

impl<S: FollowStore> FollowService<S> {
    /// Creates the service on top of `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    fn reject_self(source: UserId, target: UserId) -> Result<(), ServiceError> {
        if source == target {
            return Err(ServiceError::InvalidArgument(
                "a user cannot follow themselves".to_string(),
            ));
        }
        Ok(())
    }
}

fn to_users(records: Vec<UserRecord>) -> Vec<User> {
    records.iter().map(UserRecord::to_user).collect()
}

#[async_trait]
impl<S: FollowStore> FollowGraph for FollowService<S> {
    async fn follow(
        &self,
        _ctx: &CallContext,
        source: UserId,
        target: UserId,
    ) -> Result<(), ServiceError> {
        Self::reject_self(source, target)?;

        if self.storage.add_follow(source, target).await? {
            info!(op = "follow.follow", %source, %target, "follow added");
        } else {
            debug!(op = "follow.follow", %source, %target, "already following");
        }
        Ok(())
    }

    async fn unfollow(
        &self,
        _ctx: &CallContext,
        source: UserId,
        target: UserId,
    ) -> Result<(), ServiceError> {
        Self::reject_self(source, target)?;

        if self.storage.remove_follow(source, target).await? {
            info!(op = "follow.unfollow", %source, %target, "follow removed");
        }
        Ok(())
    }

    async fn followers(&self, _ctx: &CallContext, id: UserId) -> Result<Vec<User>, ServiceError> {
        Ok(to_users(self.storage.followers(id).await?))
    }

    async fn followees(&self, _ctx: &CallContext, id: UserId) -> Result<Vec<User>, ServiceError> {
        Ok(to_users(self.storage.followees(id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, UserStore};

    async fn service() -> FollowService<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::in_memory());
        for login in ["alice", "bob", "carol"] {
            storage.insert_user(login, "x@example.com", "d").await.unwrap();
        }
        FollowService::new(storage)
    }

    #[tokio::test]
    async fn duplicate_follow_and_unfollow_succeed() {
        let svc = service().await;
        let ctx = CallContext::new();

        svc.follow(&ctx, UserId(1), UserId(2)).await.unwrap();
        svc.follow(&ctx, UserId(1), UserId(2)).await.unwrap();
        assert_eq!(svc.followers(&ctx, UserId(2)).await.unwrap().len(), 1);

        svc.unfollow(&ctx, UserId(1), UserId(2)).await.unwrap();
        svc.unfollow(&ctx, UserId(1), UserId(2)).await.unwrap();
        assert!(svc.followers(&ctx, UserId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_follow_is_rejected() {
        let svc = service().await;
        let err = svc
            .follow(&CallContext::new(), UserId(1), UserId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_users_are_not_found() {
        let svc = service().await;
        let ctx = CallContext::new();

        let err = svc.follow(&ctx, UserId(1), UserId(7)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound(UserId(7))));

        let err = svc.followees(&ctx, UserId(8)).await.unwrap_err();
        assert!(matches!(err, ServiceError::UserNotFound(UserId(8))));
    }

    #[tokio::test]
    async fn followers_and_followees_are_ordered() {
        let svc = service().await;
        let ctx = CallContext::new();

        svc.follow(&ctx, UserId(3), UserId(1)).await.unwrap();
        svc.follow(&ctx, UserId(2), UserId(1)).await.unwrap();
        svc.follow(&ctx, UserId(1), UserId(3)).await.unwrap();

        let followers = svc.followers(&ctx, UserId(1)).await.unwrap();
        let ids = followers.iter().map(|u| u.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![UserId(2), UserId(3)]);

        let followees = svc.followees(&ctx, UserId(1)).await.unwrap();
        assert_eq!(followees.iter().map(|u| u.id).collect::<Vec<_>>(), vec![UserId(3)]);
    }
}
