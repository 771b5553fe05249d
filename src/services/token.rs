//! Password digests and token minting.

use std::time::Duration;

use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::models::UserId;

type HmacSha256 = Hmac<Sha256>;

const REFRESH_TOKEN_BYTES: usize = 32;

/// Signs access tokens and digests passwords with the service secret.
///
/// Access tokens have the form `{user_id}.{expires_at}.{hex(hmac)}` and can be checked without
/// touching storage. Refresh tokens are random and only meaningful together with the record
/// storage keeps for them.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    /// Creates a signer for the given secret and token lifetimes.
    pub fn new(secret: impl AsRef<[u8]>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            access_ttl,
            refresh_ttl,
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
    }

    /// Hex digest stored in place of the password.
    pub fn password_digest(&self, login: &str, password: &str) -> String {
        let mut mac = self.mac();
        mac.update(login.as_bytes());
        mac.update(b"\0");
        mac.update(password.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Checks a password against a stored digest in constant time.
    pub fn verify_password(&self, login: &str, password: &str, digest: &str) -> bool {
        let Ok(expected) = hex::decode(digest) else {
            return false;
        };

        let mut mac = self.mac();
        mac.update(login.as_bytes());
        mac.update(b"\0");
        mac.update(password.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Mints an access token for `user_id` issued at `now`.
    pub fn access_token(&self, user_id: UserId, now: u64) -> String {
        let expires_at = now.saturating_add(self.access_ttl.as_secs());
        let signature = hex::encode(self.access_mac(user_id, expires_at).finalize().into_bytes());
        format!("{user_id}.{expires_at}.{signature}")
    }

    /// Returns the owner of a valid, unexpired access token.
    pub fn verify_access(&self, token: &str, now: u64) -> Option<UserId> {
        let mut parts = token.splitn(3, '.');
        let user_id = UserId(parts.next()?.parse().ok()?);
        let expires_at: u64 = parts.next()?.parse().ok()?;
        let signature = hex::decode(parts.next()?).ok()?;

        self.access_mac(user_id, expires_at)
            .verify_slice(&signature)
            .ok()?;

        (now < expires_at).then_some(user_id)
    }

    fn access_mac(&self, user_id: UserId, expires_at: u64) -> HmacSha256 {
        let mut mac = self.mac();
        mac.update(format!("access.{user_id}.{expires_at}").as_bytes());
        mac
    }

    /// Draws a fresh refresh token.
    pub fn refresh_token(&self) -> String {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Expiry of a refresh token issued at `now`.
    pub fn refresh_expiry(&self, now: u64) -> u64 {
        now.saturating_add(self.refresh_ttl.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Duration::from_secs(60), Duration::from_secs(3600))
    }

    #[test]
    fn password_digest_verifies() {
        let signer = signer();
        let digest = signer.password_digest("alice", "hunter22");

        assert!(signer.verify_password("alice", "hunter22", &digest));
        assert!(!signer.verify_password("alice", "hunter23", &digest));
        assert!(!signer.verify_password("alicf", "hunter22", &digest));
        assert!(!signer.verify_password("alice", "hunter22", "not-hex"));
    }

    #[test]
    fn digest_depends_on_secret() {
        let other = TokenSigner::new("other", Duration::from_secs(1), Duration::from_secs(1));
        assert_ne!(
            signer().password_digest("alice", "pw"),
            other.password_digest("alice", "pw")
        );
    }

    #[test]
    fn access_token_expires() {
        let signer = signer();
        let token = signer.access_token(UserId(5), 1_000);

        assert_eq!(signer.verify_access(&token, 1_000), Some(UserId(5)));
        assert_eq!(signer.verify_access(&token, 1_059), Some(UserId(5)));
        assert_eq!(signer.verify_access(&token, 1_060), None);
    }

    #[test]
    fn refresh_tokens_are_unique_hex() {
        let signer = signer();
        let a = signer.refresh_token();
        let b = signer.refresh_token();

        assert_eq!(a.len(), REFRESH_TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn tampered_access_tokens_are_rejected(id in 1u64..1_000_000, forged in 1u64..1_000_000) {
            prop_assume!(id != forged);
            let signer = signer();
            let token = signer.access_token(UserId(id), 0);
            let (_, rest) = token.split_once('.').unwrap();
            let tampered = format!("{forged}.{rest}");

            prop_assert_eq!(signer.verify_access(&token, 0), Some(UserId(id)));
            prop_assert_eq!(signer.verify_access(&tampered, 0), None);
        }

        #[test]
        fn garbage_never_verifies(token in "\\PC{0,80}") {
            prop_assert_eq!(signer().verify_access(&token, 0), None);
        }
    }
}
