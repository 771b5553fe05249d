//! Contracts between the RPC layer and the business logic behind it.
//!
//! The registrar only ever sees `Arc<dyn Authenticator>`, `Arc<dyn UserDirectory>` and
//! `Arc<dyn FollowGraph>`. Every operation receives the [`CallContext`] of the call it serves;
//! dropping the returned future cancels the operation.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;

use crate::error::ServiceError;
use crate::models::{Credentials, TokenPair, User, UserId};

/// Metadata key carrying the caller's remaining time budget.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Execution context of a single call.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context without a deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Builds the context from request metadata.
    ///
    /// A missing or malformed `grpc-timeout` entry yields a context without a deadline; the
    /// server-wide timeout still bounds the call.
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        metadata
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(Self::with_timeout)
            .unwrap_or_default()
    }

    /// Instant after which the caller no longer waits for a result.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with [`ServiceError::DeadlineExceeded`] once the deadline has passed.
    pub fn ensure_active(&self) -> Result<(), ServiceError> {
        if self.is_expired() {
            return Err(ServiceError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `fut` to completion unless the deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        self.ensure_active()?;
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| ServiceError::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}

/// Parses a `grpc-timeout` value such as `250m` or `5S`.
///
/// The value is at most eight ASCII digits followed by one unit: `H`, `M`, `S`, `m` (millis),
/// `u` (micros) or `n` (nanos).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let unit = value.chars().last()?;
    let digits = &value[..value.len() - unit.len_utf8()];

    if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        'H' => Duration::from_secs(amount * 3600),
        'M' => Duration::from_secs(amount * 60),
        'S' => Duration::from_secs(amount),
        'm' => Duration::from_millis(amount),
        'u' => Duration::from_micros(amount),
        'n' => Duration::from_nanos(amount),
        _ => return None,
    };

    Some(duration)
}

/// Token issuance.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Exchanges valid credentials for a token pair.
    async fn login(&self, ctx: &CallContext, credentials: Credentials)
        -> Result<TokenPair, ServiceError>;

    /// Registers a new identity and logs it in.
    async fn sign_up(
        &self,
        ctx: &CallContext,
        email: String,
        credentials: Credentials,
    ) -> Result<TokenPair, ServiceError>;

    /// Rotates a refresh token into a fresh pair.
    async fn refresh_tokens(
        &self,
        ctx: &CallContext,
        refresh_token: String,
    ) -> Result<TokenPair, ServiceError>;
}

/// Read access to registered users.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Looks up one user.
    async fn user(&self, ctx: &CallContext, id: UserId) -> Result<User, ServiceError>;

    /// Looks up several users, ordered by id.
    async fn users(
        &self,
        ctx: &CallContext,
        ids: BTreeSet<UserId>,
    ) -> Result<Vec<User>, ServiceError>;

    /// Returns true when every id belongs to a registered user.
    async fn users_exist(
        &self,
        ctx: &CallContext,
        ids: BTreeSet<UserId>,
    ) -> Result<bool, ServiceError>;

    /// Finds users whose login contains `query`, ordered by id.
    async fn users_by_login(
        &self,
        ctx: &CallContext,
        query: String,
    ) -> Result<Vec<User>, ServiceError>;
}

/// Directed follow relationships between users.
#[async_trait]
pub trait FollowGraph: Send + Sync + 'static {
    /// Makes `source` follow `target`.
    async fn follow(
        &self,
        ctx: &CallContext,
        source: UserId,
        target: UserId,
    ) -> Result<(), ServiceError>;

    /// Removes the `source` → `target` edge.
    async fn unfollow(
        &self,
        ctx: &CallContext,
        source: UserId,
        target: UserId,
    ) -> Result<(), ServiceError>;

    /// Users following `id`, ordered by id.
    async fn followers(&self, ctx: &CallContext, id: UserId) -> Result<Vec<User>, ServiceError>;

    /// Users `id` follows, ordered by id.
    async fn followees(&self, ctx: &CallContext, id: UserId) -> Result<Vec<User>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tonic::metadata::MetadataValue;

    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_grpc_timeout("2H"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_grpc_timeout("3M"), Some(Duration::from_secs(180)));
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("40u"), Some(Duration::from_micros(40)));
        assert_eq!(parse_grpc_timeout("9n"), Some(Duration::from_nanos(9)));
    }

    #[test]
    fn rejects_malformed_timeouts() {
        for value in ["", "S", "10", "10x", "123456789S", "-5S", "1.5S"] {
            assert_eq!(parse_grpc_timeout(value), None, "{value:?}");
        }
    }

    #[tokio::test]
    async fn context_without_deadline_never_expires() {
        let ctx = CallContext::new();
        assert!(!ctx.is_expired());
        assert!(ctx.ensure_active().is_ok());
        assert_eq!(ctx.run(async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn expired_context_short_circuits() {
        let ctx = CallContext::with_deadline(Instant::now());
        assert!(ctx.is_expired());

        let polled = std::sync::atomic::AtomicBool::new(false);
        let result = ctx
            .run(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ServiceError::DeadlineExceeded)));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_waiting_at_the_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ServiceError::DeadlineExceeded)));
    }

    #[test]
    fn context_reads_grpc_timeout_metadata() {
        let mut metadata = MetadataMap::new();
        metadata.insert(GRPC_TIMEOUT_HEADER, MetadataValue::from_static("30S"));

        let ctx = CallContext::from_metadata(&metadata);
        assert!(ctx.deadline().is_some());
        assert!(!ctx.is_expired());

        let ctx = CallContext::from_metadata(&MetadataMap::new());
        assert!(ctx.deadline().is_none());
    }

    proptest! {
        #[test]
        fn millisecond_timeouts_round_trip(amount in 0u64..100_000_000) {
            let value = format!("{amount}m");
            prop_assert_eq!(parse_grpc_timeout(&value), Some(Duration::from_millis(amount)));
        }

        #[test]
        fn arbitrary_input_never_panics(value in "\\PC{0,12}") {
            let _ = parse_grpc_timeout(&value);
        }
    }
}
