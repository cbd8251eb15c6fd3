//! Bearer tokens for registry calls.
//!
//! The registry authenticates callers with an OAuth client-credentials token. Tokens are
//! cached until shortly before they expire; callers that see the registry reject a token
//! ask for a forced refresh.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::TokenError;
use crate::tls;

/// Upper bound on how long a token is cached, whatever lifetime the provider reports.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// An opaque bearer token. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the `Authorization` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty token means requests go out unauthenticated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a valid token, bypassing any cache when `force_refresh` is set.
    async fn fetch_token(&self, force_refresh: bool) -> Result<AccessToken, TokenError>;
}

/// Used when the registry runs with authentication disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpTokenProvider;

#[async_trait]
impl TokenProvider for NoOpTokenProvider {
    async fn fetch_token(&self, _force_refresh: bool) -> Result<AccessToken, TokenError> {
        Ok(AccessToken::default())
    }
}

/// Settings for [`OAuthTokenFetcher`].
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    /// Base URL of the identity provider, e.g. `https://uaa.example.com:8443`.
    pub base_url: String,
    /// OAuth client id.
    pub client_name: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Attempts per fetch; at least one attempt is always made.
    pub max_retries: u32,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
    /// Cached tokens are treated as expired this long before their real expiry.
    pub expiration_buffer: Duration,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_certs: Option<PathBuf>,
    /// Accept any server certificate.
    pub skip_ssl_validation: bool,
    /// Bound on each token request.
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    refresh_at: Instant,
}

/// Client-credentials token fetcher with caching and bounded retries.
pub struct OAuthTokenFetcher {
    client: reqwest::Client,
    token_url: String,
    settings: OAuthSettings,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenFetcher {
    /// Build the HTTP client. Fails when the CA bundle cannot be loaded.
    pub fn new(settings: OAuthSettings) -> Result<Self, TokenError> {
        let builder = reqwest::Client::builder().timeout(settings.request_timeout);
        let client = tls::configure_trust(
            builder,
            settings.ca_certs.as_deref(),
            settings.skip_ssl_validation,
        )?
        .build()?;

        Ok(Self {
            client,
            token_url: format!("{}/oauth/token", settings.base_url.trim_end_matches('/')),
            settings,
            cached: Mutex::new(None),
        })
    }

    async fn request_token(&self) -> Result<TokenResponse, TokenError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.settings.client_name, Some(&self.settings.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_name.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<TokenResponse>().await?)
    }

    async fn request_with_retries(&self) -> Result<TokenResponse, TokenError> {
        let attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.request_token().await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            // Client errors mean the credentials are wrong; retrying will not help.
            let retryable = !matches!(&err, TokenError::Rejected { status, .. } if *status < 500);
            tracing::warn!(attempt, attempts, error = %err, "token fetch failed");
            if !retryable {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(TokenError::Exhausted {
                    attempts,
                    last: err.to_string(),
                });
            }
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenFetcher {
    async fn fetch_token(&self, force_refresh: bool) -> Result<AccessToken, TokenError> {
        let mut cached = self.cached.lock().await;
        if !force_refresh {
            if let Some(cached) = cached.as_ref() {
                if Instant::now() < cached.refresh_at {
                    return Ok(cached.token.clone());
                }
            }
        }

        let response = self.request_with_retries().await?;
        let lifetime = Duration::from_secs(response.expires_in)
            .min(MAX_TOKEN_LIFETIME)
            .saturating_sub(self.settings.expiration_buffer);
        let token = AccessToken::new(response.access_token);
        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        tracing::debug!(expires_in = response.expires_in, "fetched access token");
        Ok(token)
    }
}
