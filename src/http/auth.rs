//! Authentication collaborator used by the gate.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use crate::config::AuthConfig;

/// The caller an authenticated request acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Resolves request credentials to a principal.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` means the request is not authenticated.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Accepts a fixed set of bearer tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    /// token -> subject
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new<I, T, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, subject)| (token.into(), subject.into()))
                .collect(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config
                .tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.subject.clone())),
        )
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = bearer_token(headers)?;
        self.tokens.get(token).map(|subject| Principal {
            subject: subject.clone(),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
