//! # Static credentials
//!
//! A session fixed at construction time, as loaded from configuration. The
//! token stays wrapped in a `SecretString` and is only exposed when a request
//! header is built.

use domains::{Credentials, Identity};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: Option<SecretString>,
    identity: Option<Identity>,
}

impl StaticCredentials {
    pub fn new(token: SecretString, identity: Identity) -> Self {
        Self { token: Some(token), identity: Some(identity) }
    }

    /// No session: authenticated operations fail with `NotAuthenticated`.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Builds a session only when both a token and a user id are present.
    pub fn from_parts(token: Option<SecretString>, user_id: Option<String>, name: Option<String>) -> Self {
        match (token, user_id) {
            (Some(token), Some(user_id)) => Self::new(
                token,
                Identity { name: name.unwrap_or_else(|| user_id.clone()), user_id, avatar_url: None },
            ),
            _ => Self::anonymous(),
        }
    }
}

impl Credentials for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token.as_ref().map(|t| t.expose_secret().to_string())
    }

    fn identity(&self) -> Option<Identity> {
        self.identity.clone()
    }
}
