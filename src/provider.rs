//! Collaborators supplying the session credential and the market snapshot

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{FeedError, Result};
use crate::market::MarketSnapshot;
use crate::parser::parse_snapshot;

/// Supplies the session credential sent with the WebSocket upgrade
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn session_credential(&self) -> Result<String>;
}

/// Fetches the full market snapshot, once per connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<MarketSnapshot>;
}

/// Fixed credential, typically copied from a logged-in browser session
#[derive(Clone)]
pub struct StaticCredentialProvider {
    credential: String,
}

impl StaticCredentialProvider {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
        }
    }

    /// Read the credential from an environment variable
    pub fn from_env(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(Self::new(value.trim())),
            _ => Err(FeedError::AuthUnavailable(format!("{var} is not set"))),
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl std::fmt::Debug for StaticCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentialProvider")
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn session_credential(&self) -> Result<String> {
        if self.credential.is_empty() {
            return Err(FeedError::AuthUnavailable("empty session credential".into()));
        }
        Ok(self.credential.clone())
    }
}

/// Fetches the snapshot from a REST endpoint using the session cookie
pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
    url: String,
    cookie: String,
}

impl HttpSnapshotFetcher {
    /// `timeout` bounds each request from connect to the last body byte
    pub fn new(url: &str, cookie_name: &str, credential: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            cookie: format!("{cookie_name}={credential}"),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch_snapshot(&self) -> Result<MarketSnapshot> {
        debug!(url = %self.url, "Fetching market snapshot");

        let body = self
            .client
            .get(&self.url)
            .header(reqwest::header::COOKIE, &self.cookie)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let snapshot = parse_snapshot(&body)
            .map_err(|e| FeedError::SnapshotFetchError(format!("invalid snapshot: {e}")))?;
        info!(markets = snapshot.len(), "Market snapshot fetched");
        Ok(snapshot)
    }
}
