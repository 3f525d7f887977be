//! Bearer credentials for the upstream realtime service.
//!
//! A [`TokenSource`] performs a single fetch against an identity provider. The
//! [`CachedTokenProvider`] wraps a source and hands out the cached token while
//! it is still valid, refreshing it in place otherwise.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tokens this close to expiry are refreshed instead of handed out.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// `gcloud` does not report a lifetime; its access tokens last an hour.
const GCLOUD_TOKEN_LIFETIME: Duration = Duration::from_secs(55 * 60);

pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Failures while acquiring or refreshing a bearer token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("Identity provider returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("Identity provider returned an empty token")]
    EmptyToken,
    #[error("Credential command failed: {0}")]
    Command(String),
}

/// An opaque bearer credential with an optional expiry.
#[derive(Clone)]
pub struct BearerToken {
    value: String,
    expires_at: Option<Instant>,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// A token that expires `ttl` from now.
    pub fn expiring_in(value: impl Into<String>, ttl: Duration) -> Self {
        Self::new(value, Some(Instant::now() + ttl))
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// A token is usable if it is non-empty and not within the expiry skew.
    pub fn is_valid(&self) -> bool {
        if self.value.is_empty() {
            return false;
        }
        match self.expires_at {
            None => true,
            Some(expires_at) => Instant::now() + EXPIRY_SKEW < expires_at,
        }
    }

    /// The value for an HTTP `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

// Never print the credential itself.
impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A single fetch of a fresh token from an identity provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<BearerToken, AuthError>;
}

/// Hands out a valid bearer token, refreshing it when needed.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<BearerToken, AuthError>;
}

/// Caches the last token from a [`TokenSource`].
///
/// The cache lock is held across a refresh, so concurrent callers that all
/// find an expired token trigger a single fetch and share its result.
pub struct CachedTokenProvider<S> {
    source: S,
    cache: Mutex<Option<BearerToken>>,
}

impl<S: TokenSource> CachedTokenProvider<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<S: TokenSource> TokenProvider for CachedTokenProvider<S> {
    async fn token(&self) -> Result<BearerToken, AuthError> {
        let mut cached = self.cache.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid()) {
            debug!("Using cached bearer token.");
            return Ok(token.clone());
        }

        info!("Refreshing bearer token.");
        let fresh = self.source.fetch().await?;
        if fresh.value.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        if !fresh.is_valid() {
            return Err(AuthError::InvalidResponse(
                "token expires within the refresh skew".to_string(),
            ));
        }
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// A fixed token supplied through configuration. Never expires.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<BearerToken, AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(BearerToken::new(self.token.trim(), None))
    }
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Fetches the default service account token from the compute metadata server.
pub struct MetadataTokenSource {
    client: reqwest::Client,
    url: String,
}

impl MetadataTokenSource {
    pub fn new() -> Self {
        Self::with_url(METADATA_TOKEN_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Default for MetadataTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn fetch(&self) -> Result<BearerToken, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::InvalidResponse(format!(
                "metadata server answered {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;
        parse_metadata_token(&body)
    }
}

fn parse_metadata_token(body: &str) -> Result<BearerToken, AuthError> {
    let parsed: MetadataTokenResponse =
        serde_json::from_str(body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    if parsed.access_token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    let expires_at = Instant::now()
        .checked_add(Duration::from_secs(parsed.expires_in))
        .ok_or_else(|| {
            AuthError::InvalidResponse(format!("expires_in out of range: {}", parsed.expires_in))
        })?;
    Ok(BearerToken::new(parsed.access_token, Some(expires_at)))
}

/// Shells out to `gcloud auth print-access-token` for local development.
pub struct GcloudTokenSource {
    program: String,
}

impl GcloudTokenSource {
    pub fn new() -> Self {
        Self {
            program: "gcloud".to_string(),
        }
    }
}

impl Default for GcloudTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for GcloudTokenSource {
    async fn fetch(&self) -> Result<BearerToken, AuthError> {
        let output = tokio::process::Command::new(&self.program)
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| AuthError::Command(format!("could not run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::Command(stderr.trim().to_string()));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(BearerToken::expiring_in(token, GCLOUD_TOKEN_LIFETIME))
    }
}
