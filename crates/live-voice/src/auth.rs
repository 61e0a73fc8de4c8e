//! Credentials and the token provider seam.
//!
//! Acquiring tokens (OAuth flows, service accounts) happens elsewhere. The
//! session only needs something that hands out a current credential and can be
//! asked for a fresh one after the service rejects the old one.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// A bearer credential with optional expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expiry| expiry <= Utc::now())
            .unwrap_or(false)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential available: {0}")]
    Missing(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential rejected after refresh: {0}")]
    Rejected(String),
}

/// Source of credentials for connecting.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current credential, possibly cached.
    async fn get_token(&self) -> Result<Credential, AuthError>;

    /// Force a fresh credential. Called after the service rejects the current one.
    async fn refresh_token(&self) -> Result<Credential, AuthError>;
}

/// Fixed credential, e.g. an API key. Refresh hands back the same key.
pub struct StaticTokenProvider {
    credential: Credential,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Credential, AuthError> {
        if self.credential.token.is_empty() {
            return Err(AuthError::Missing("static token is empty".into()));
        }
        Ok(self.credential.clone())
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        self.get_token().await
    }
}

/// Reads the credential from an environment variable on every call, so a
/// rotated value is picked up on refresh.
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    fn read(&self) -> Result<Credential, AuthError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(AuthError::Missing(format!("{} is not set", self.var))),
        }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn get_token(&self) -> Result<Credential, AuthError> {
        self.read()
    }

    async fn refresh_token(&self) -> Result<Credential, AuthError> {
        self.read()
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))
    }
}

static AUTH_FAILURE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(401|403|unauthori[sz]ed|unauthenticated|forbidden|permission[ _]denied|api key not valid|invalid api key)\b",
    )
    .ok()
});

/// Whether a close reason or error message indicates a rejected credential.
pub fn is_auth_failure(text: &str) -> bool {
    AUTH_FAILURE
        .as_ref()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}
