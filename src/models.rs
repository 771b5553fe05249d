use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier assigned to a user by storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Public view of a registered user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Storage-assigned identifier.
    pub id: UserId,
    /// Unique login.
    pub login: String,
    /// Contact email.
    pub email: String,
}

/// Login and password presented by a caller.
#[derive(Clone)]
pub struct Credentials {
    /// Login name.
    pub login: String,
    /// Plain-text password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials from a login and password.
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Access and refresh tokens issued together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenPair {
    /// Short-lived token presented on every call.
    pub access_token: String,
    /// Single-use token exchanged for a new pair.
    pub refresh_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter22");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter22"));
    }
}
