//! Token Providers
//!
//! Ready-made [`TokenProvider`] implementations. Fetching a token from the
//! REST `GetWebSocketsToken` endpoint is left to callers, who can plug it in
//! through [`FnTokenProvider`].

use std::fmt;
use std::future::Future;

use async_trait::async_trait;

use crate::application::ports::{TokenError, TokenProvider};

/// Always returns the same token.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a token obtained elsewhere.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<String, TokenError> {
        if self.token.is_empty() {
            return Err(TokenError::Unavailable("static token is empty".to_owned()));
        }
        Ok(self.token.clone())
    }
}

/// Calls an async closure for every fetch.
pub struct FnTokenProvider<F> {
    fetch: F,
}

impl<F> FnTokenProvider<F> {
    /// Use `fetch` to obtain tokens.
    #[must_use]
    pub const fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F> fmt::Debug for FnTokenProvider<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTokenProvider").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, TokenError>> + Send,
{
    async fn fetch_token(&self) -> Result<String, TokenError> {
        (self.fetch)().await
    }
}
