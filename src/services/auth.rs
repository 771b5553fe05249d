use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::token::TokenSigner;
use crate::capability::{Authenticator, CallContext};
use crate::error::ServiceError;
use crate::models::{Credentials, TokenPair, UserId};
use crate::storage::{unix_now, RefreshRecord, TokenStore, UserStore};

const LOGIN_LEN: std::ops::RangeInclusive<usize> = 3..=64;
const PASSWORD_LEN: std::ops::RangeInclusive<usize> = 6..=128;

/// Reference [`Authenticator`] backed by a user and token store.
pub struct AuthService<S> {
    storage: Arc<S>,
    signer: TokenSigner,
}

impl<S> AuthService<S>
where
    S: UserStore + TokenStore,
{
    /// Creates the service on top of `storage`.
    pub fn new(storage: Arc<S>, signer: TokenSigner) -> Self {
        Self { storage, signer }
    }

    fn validate_login(login: &str) -> Result<(), ServiceError> {
        if !LOGIN_LEN.contains(&login.chars().count()) {
            return Err(ServiceError::InvalidArgument(format!(
                "login must be {} to {} characters",
                LOGIN_LEN.start(),
                LOGIN_LEN.end()
            )));
        }

        if !login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(ServiceError::InvalidArgument(
                "login contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_password(password: &str) -> Result<(), ServiceError> {
        if !PASSWORD_LEN.contains(&password.chars().count()) {
            return Err(ServiceError::InvalidArgument(format!(
                "password must be {} to {} characters",
                PASSWORD_LEN.start(),
                PASSWORD_LEN.end()
            )));
        }
        Ok(())
    }

    fn validate_email(email: &str) -> Result<(), ServiceError> {
        match email.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(())
            }
            _ => Err(ServiceError::InvalidArgument("invalid email".to_string())),
        }
    }

    async fn issue(&self, user_id: UserId) -> Result<TokenPair, ServiceError> {
        let now = unix_now();
        let access_token = self.signer.access_token(user_id, now);
        let refresh_token = self.signer.refresh_token();

        self.storage
            .save_refresh_token(
                &refresh_token,
                RefreshRecord {
                    user_id,
                    expires_at: self.signer.refresh_expiry(now),
                },
            )
            .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}

#[async_trait]
impl<S> Authenticator for AuthService<S>
where
    S: UserStore + TokenStore,
{
    async fn login(
        &self,
        ctx: &CallContext,
        credentials: Credentials,
    ) -> Result<TokenPair, ServiceError> {
        if credentials.login.is_empty() || credentials.password.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "login and password are required".to_string(),
            ));
        }

        let user = self
            .storage
            .user_by_login(&credentials.login)
            .await?
            .ok_or(ServiceError::InvalidCredentials);

        let user = match user {
            Ok(user)
                if self.signer.verify_password(
                    &credentials.login,
                    &credentials.password,
                    &user.password_digest,
                ) =>
            {
                user
            }
            _ => {
                warn!(op = "auth.login", login = %credentials.login, "invalid credentials");
                return Err(ServiceError::InvalidCredentials);
            }
        };

        ctx.ensure_active()?;
        let tokens = self.issue(user.id).await?;
        info!(op = "auth.login", user_id = %user.id, "user logged in");
        Ok(tokens)
    }

    async fn sign_up(
        &self,
        ctx: &CallContext,
        email: String,
        credentials: Credentials,
    ) -> Result<TokenPair, ServiceError> {
        Self::validate_login(&credentials.login)?;
        Self::validate_password(&credentials.password)?;
        Self::validate_email(&email)?;

        let digest = self
            .signer
            .password_digest(&credentials.login, &credentials.password);
        let user = self
            .storage
            .insert_user(&credentials.login, &email, &digest)
            .await?;

        ctx.ensure_active()?;
        let tokens = self.issue(user.id).await?;
        info!(op = "auth.sign_up", user_id = %user.id, login = %user.login, "user registered");
        Ok(tokens)
    }

    async fn refresh_tokens(
        &self,
        ctx: &CallContext,
        refresh_token: String,
    ) -> Result<TokenPair, ServiceError> {
        if refresh_token.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "refresh token is required".to_string(),
            ));
        }

        let record = self
            .storage
            .take_refresh_token(&refresh_token)
            .await?
            .ok_or(ServiceError::InvalidRefreshToken)?;

        if record.is_expired(unix_now()) {
            return Err(ServiceError::InvalidRefreshToken);
        }

        ctx.ensure_active()?;
        self.issue(record.user_id).await
    }
}
