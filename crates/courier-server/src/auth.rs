//! Connection gate authentication.
//!
//! Clients present a token either as a `token` query parameter or as an
//! `Authorization: Bearer` header. Verifying the token is delegated to an
//! [`Authenticator`]; the core only ever sees the resolved user id.

use axum::http::{header, HeaderMap};
use courier_protocol::UserId;
use std::collections::HashMap;

/// Resolves a presented token to a user.
pub trait Authenticator: Send + Sync {
    /// Returns `None` if the token is not accepted.
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Accepts a fixed set of tokens from configuration.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    #[must_use]
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).copied().filter(|user_id| *user_id > 0)
    }
}

/// Pull the presented token from the query string or headers.
///
/// The query parameter wins when both are present.
#[must_use]
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.filter(|token| !token.is_empty()) {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
