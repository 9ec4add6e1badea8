//! Implementation of OAuth2 client-credentials authentication.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use url::Url;

use crate::Error;
use crate::Result;
use crate::config::SecretString;

/// The lifetime assumed for tokens whose response omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// The longest lifetime a token is trusted for, whatever the endpoint reports.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Represents the credentials of an OAuth2 client.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// The client identifier.
    pub client_id: String,
    /// The client secret.
    pub client_secret: SecretString,
    /// The URL of the token endpoint.
    pub token_url: Url,
}

/// Represents an access token.
#[derive(Debug, Clone)]
pub struct Token {
    /// The bearer token.
    access_token: secrecy::SecretString,
    /// The time at which the token expires.
    expires_at: Instant,
}

impl Token {
    /// Constructs a new token.
    ///
    /// The lifetime is capped at [`MAX_TOKEN_LIFETIME`].
    pub fn new(access_token: impl Into<String>, lifetime: Duration) -> Self {
        let access_token: String = access_token.into();
        let now = Instant::now();
        Self {
            access_token: access_token.into(),
            expires_at: now
                .checked_add(lifetime.min(MAX_TOKEN_LIFETIME))
                .unwrap_or(now),
        }
    }

    /// Gets the bearer token.
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Gets the time at which the token expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Determines if the token is expired or will expire within `leeway`.
    pub fn is_expired(&self, leeway: Duration) -> bool {
        Instant::now()
            .checked_add(leeway)
            .is_none_or(|deadline| deadline >= self.expires_at)
    }
}

/// Represents the response of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    /// The access token.
    #[serde(default)]
    access_token: Option<String>,
    /// The lifetime of the token in seconds.
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Represents an error response of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenError {
    /// The error code.
    error: String,
    /// The error description.
    #[serde(default)]
    error_description: Option<String>,
}

/// Obtains and caches access tokens using the client-credentials grant.
///
/// The cached token is shared by every request made through the client and is
/// refreshed once it is within the configured leeway of expiring.
#[derive(Debug)]
pub struct Authenticator {
    /// The HTTP client used for token requests.
    client: reqwest::Client,
    /// The client credentials.
    credentials: Credentials,
    /// The duration before expiry at which the token is refreshed.
    leeway: Duration,
    /// The cached token.
    token: Mutex<Option<Token>>,
}

impl Authenticator {
    /// Constructs a new authenticator.
    pub fn new(client: reqwest::Client, credentials: Credentials, leeway: Duration) -> Self {
        Self {
            client,
            credentials,
            leeway,
            token: Mutex::new(None),
        }
    }

    /// Requests a new access token from the token endpoint.
    ///
    /// The returned token is not cached.
    pub async fn authenticate(&self) -> Result<Token> {
        let url = &self.credentials.token_url;
        debug!("requesting access token from `{url}`");

        let response = self
            .client
            .post(url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                (
                    "client_secret",
                    self.credentials.client_secret.inner().expose_secret(),
                ),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("failed to reach token endpoint `{url}`: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Auth(format!("failed to read token response: {e}")))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<TokenError>(&body) {
                Ok(TokenError {
                    error,
                    error_description: Some(description),
                }) => format!("{error}: {description}"),
                Ok(TokenError { error, .. }) => error,
                Err(_) => body,
            };

            return Err(Error::Auth(format!(
                "token endpoint responded with status {status}: {message}"
            )));
        }

        let response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Auth(format!("token response is not valid JSON: {e}")))?;

        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Auth("token response does not contain an access token".to_string())
            })?;

        let lifetime = match response.expires_in.map(Duration::from_secs) {
            Some(lifetime) if lifetime > MAX_TOKEN_LIFETIME => {
                debug!(
                    "token endpoint reported a lifetime of {lifetime:?}: using \
                     {MAX_TOKEN_LIFETIME:?}"
                );
                MAX_TOKEN_LIFETIME
            }
            Some(lifetime) => lifetime,
            None => DEFAULT_TOKEN_LIFETIME,
        };

        info!(
            "obtained access token for client `{id}` valid for {lifetime:?}",
            id = self.credentials.client_id
        );
        Ok(Token::new(access_token, lifetime))
    }

    /// Gets a valid bearer token, authenticating if the cached token is
    /// missing or expired.
    pub async fn bearer(&self) -> Result<String> {
        // Holding the lock while authenticating ensures concurrent callers wait
        // for a single refresh
        let mut token = self.token.lock().await;
        match &*token {
            Some(t) if !t.is_expired(self.leeway) => Ok(t.access_token().to_string()),
            _ => {
                let fresh = self.authenticate().await?;
                let bearer = fresh.access_token().to_string();
                *token = Some(fresh);
                Ok(bearer)
            }
        }
    }

    /// Discards the cached token so the next request re-authenticates.
    pub async fn invalidate(&self) {
        self.token.lock().await.take();
    }
}
