//! Implementation of client configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::Category;
use crate::Credentials;
use crate::Error;
use crate::Result;

/// The environment variable holding the FirecREST base URL.
pub const FIRECREST_URL_ENV: &str = "FIRECREST_URL";

/// The environment variable holding the OAuth2 client identifier.
pub const CLIENT_ID_ENV: &str = "FIRECREST_CLIENT_ID";

/// The environment variable holding the OAuth2 client secret.
pub const CLIENT_SECRET_ENV: &str = "FIRECREST_CLIENT_SECRET";

/// The environment variable holding the OAuth2 token endpoint.
pub const TOKEN_URL_ENV: &str = "AUTH_TOKEN_URL";

/// The default number of seconds between consecutive calls in a category.
pub const DEFAULT_RATE_LIMIT: f64 = 5.0;

/// The default number of seconds between task status polls.
pub const DEFAULT_TASK_INTERVAL: f64 = 5.0;

/// The default number of seconds between job state polls.
pub const DEFAULT_JOB_INTERVAL: f64 = 30.0;

/// The default number of seconds before expiry at which a token is refreshed.
pub const DEFAULT_EXPIRY_LEEWAY: f64 = 10.0;

/// The default number of retries for idempotent requests.
pub const DEFAULT_RETRIES: usize = 3;

/// The largest number of seconds accepted for any interval (one week).
pub const MAX_SECONDS: f64 = 7.0 * 24.0 * 60.0 * 60.0;

/// The default lowest task status code considered successful.
pub const DEFAULT_SUCCESS_MIN: u16 = 200;

/// The default highest task status code considered successful.
pub const DEFAULT_SUCCESS_MAX: u16 = 299;

/// The string that replaces redacted serialization fields.
const REDACTED: &str = "<REDACTED>";

/// Represents a secret string that is, by default, redacted for serialization.
///
/// This type is a wrapper around [`secrecy::SecretString`].
#[derive(Debug, Clone)]
pub struct SecretString {
    /// The inner secret string.
    ///
    /// This type is not serializable.
    inner: secrecy::SecretString,
    /// Whether or not the secret string is redacted for serialization.
    ///
    /// If `true` (the default), `<REDACTED>` is serialized for the string's
    /// value.
    ///
    /// If `false`, the inner secret string is exposed for serialization.
    redacted: bool,
}

impl SecretString {
    /// Redacts the secret for serialization.
    ///
    /// By default, a [`SecretString`] is redacted; when redacted, the string is
    /// replaced with `<REDACTED>` when serialized.
    pub fn redact(&mut self) {
        self.redacted = true;
    }

    /// Unredacts the secret for serialization.
    pub fn unredact(&mut self) {
        self.redacted = false;
    }

    /// Gets the inner [`secrecy::SecretString`].
    pub fn inner(&self) -> &secrecy::SecretString {
        &self.inner
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self {
            inner: s.into(),
            redacted: true,
        }
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self {
            inner: s.into(),
            redacted: true,
        }
    }
}

impl serde::Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use secrecy::ExposeSecret;

        if self.redacted {
            serializer.serialize_str(REDACTED)
        } else {
            serializer.serialize_str(self.inner.expose_secret())
        }
    }
}

impl<'de> serde::Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = secrecy::SecretString::deserialize(deserializer)?;
        Ok(Self {
            inner,
            redacted: true,
        })
    }
}

/// Converts an optional number of seconds into a duration.
///
/// Values above [`MAX_SECONDS`] are clamped and values that are not a valid
/// duration fall back to the default.
fn seconds(value: Option<f64>, default: f64) -> Duration {
    value
        .and_then(|v| Duration::try_from_secs_f64(v.min(MAX_SECONDS)).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

/// Ensures an optional number of seconds is finite, non-negative and at most
/// [`MAX_SECONDS`].
fn validate_seconds(name: &str, value: Option<f64>) -> Result<()> {
    if let Some(value) = value
        && (!value.is_finite() || !(0.0..=MAX_SECONDS).contains(&value))
    {
        return Err(Error::Config(format!(
            "configuration value `{name}` must be a number of seconds between 0 and \
             {MAX_SECONDS}"
        )));
    }

    Ok(())
}

/// Represents FirecREST client configuration.
///
/// <div class="warning">
///
/// By default, serialization of [`Config`] will redact the values of secrets.
///
/// Use the [`Config::unredact`] method before serialization to prevent the
/// secrets from being redacted.
///
/// </div>
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The base URL of the FirecREST API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Whether or not the API and token URLs may use an insecure protocol
    /// like HTTP.
    #[serde(default)]
    pub insecure: bool,
    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Client-side rate limiting configuration.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Polling configuration.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Task status classification configuration.
    #[serde(default)]
    pub task_status: TaskStatusConfig,
    /// File transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// HTTP configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Constructs a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overrides settings with values from the environment.
    ///
    /// The `var` callback is queried for each supported variable name; empty
    /// values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| var(name).filter(|v| !v.is_empty());

        if let Some(url) = get(FIRECREST_URL_ENV) {
            self.url = Some(url.parse().map_err(|e| {
                Error::Config(format!("invalid URL `{url}` in `{FIRECREST_URL_ENV}`: {e}"))
            })?);
        }

        if let Some(id) = get(CLIENT_ID_ENV) {
            self.auth.client_id = Some(id);
        }

        if let Some(secret) = get(CLIENT_SECRET_ENV) {
            self.auth.client_secret = Some(secret.into());
        }

        if let Some(url) = get(TOKEN_URL_ENV) {
            self.auth.token_url = Some(url.parse().map_err(|e| {
                Error::Config(format!("invalid URL `{url}` in `{TOKEN_URL_ENV}`: {e}"))
            })?);
        }

        Ok(())
    }

    /// Validates the client configuration.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "the FirecREST URL is required (set `url` or `{FIRECREST_URL_ENV}`)"
            ))
        })?;
        self.check_scheme("url", url)?;

        self.auth.validate()?;
        if let Some(token_url) = &self.auth.token_url {
            self.check_scheme("auth.token_url", token_url)?;
        }

        self.rate_limits.validate()?;
        self.polling.validate()?;
        self.task_status.validate()?;
        self.http.validate()?;
        Ok(())
    }

    /// Ensures a URL uses HTTPS unless insecure URLs are allowed.
    fn check_scheme(&self, name: &str, url: &Url) -> Result<()> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.insecure => Ok(()),
            "http" => Err(Error::Config(format!(
                "`{name}` has insecure URL `{url}`: use HTTPS or set `insecure` to `true`"
            ))),
            scheme => Err(Error::Config(format!(
                "`{name}` has unsupported URL scheme `{scheme}`"
            ))),
        }
    }

    /// Gets the base URL of the FirecREST API.
    pub fn url(&self) -> Result<&Url> {
        self.url
            .as_ref()
            .ok_or_else(|| Error::Config("the FirecREST URL is required".to_string()))
    }

    /// Redacts the secrets contained in the configuration.
    ///
    /// By default, secrets are redacted for serialization.
    pub fn redact(&mut self) {
        self.auth.redact();
    }

    /// Unredacts the secrets contained in the configuration.
    ///
    /// Calling this method will expose secrets for serialization.
    pub fn unredact(&mut self) {
        self.auth.unredact();
    }
}

/// Represents OAuth2 client-credentials configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AuthConfig {
    /// The OAuth2 client identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// The OAuth2 client secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,
    /// The URL of the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<Url>,
    /// The number of seconds before expiry at which a token is refreshed.
    ///
    /// Defaults to 10 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_leeway: Option<f64>,
}

impl AuthConfig {
    /// Validates the authentication configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(format!(
                "a client identifier is required (set `auth.client_id` or `{CLIENT_ID_ENV}`)"
            )));
        }

        if self.client_secret.is_none() {
            return Err(Error::Config(format!(
                "a client secret is required (set `auth.client_secret` or `{CLIENT_SECRET_ENV}`)"
            )));
        }

        if self.token_url.is_none() {
            return Err(Error::Config(format!(
                "a token URL is required (set `auth.token_url` or `{TOKEN_URL_ENV}`)"
            )));
        }

        validate_seconds("auth.expiry_leeway", self.expiry_leeway)
    }

    /// Gets the credentials described by the configuration.
    pub fn credentials(&self) -> Result<Credentials> {
        self.validate()?;

        let missing = |name: &str| Error::Config(format!("`auth.{name}` is required"));
        Ok(Credentials {
            client_id: self
                .client_id
                .clone()
                .ok_or_else(|| missing("client_id"))?,
            client_secret: self
                .client_secret
                .clone()
                .ok_or_else(|| missing("client_secret"))?,
            token_url: self
                .token_url
                .clone()
                .ok_or_else(|| missing("token_url"))?,
        })
    }

    /// Gets the duration before expiry at which a token is refreshed.
    pub fn expiry_leeway(&self) -> Duration {
        seconds(self.expiry_leeway, DEFAULT_EXPIRY_LEEWAY)
    }

    /// Redacts the client secret for serialization.
    pub fn redact(&mut self) {
        if let Some(secret) = &mut self.client_secret {
            secret.redact();
        }
    }

    /// Unredacts the client secret for serialization.
    pub fn unredact(&mut self) {
        if let Some(secret) = &mut self.client_secret {
            secret.unredact();
        }
    }
}

/// Represents the minimum number of seconds between consecutive calls for
/// each API category.
///
/// Every category defaults to 5 seconds.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct RateLimitConfig {
    /// The interval for `compute` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<f64>,
    /// The interval for `storage` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<f64>,
    /// The interval for `status` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<f64>,
    /// The interval for `tasks` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<f64>,
    /// The interval for `utilities` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilities: Option<f64>,
    /// The interval for `reservations` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<f64>,
}

impl RateLimitConfig {
    /// Constructs a rate limit configuration using the same interval for every
    /// category.
    pub fn uniform(seconds: f64) -> Self {
        Self {
            compute: Some(seconds),
            storage: Some(seconds),
            status: Some(seconds),
            tasks: Some(seconds),
            utilities: Some(seconds),
            reservations: Some(seconds),
        }
    }

    /// Gets the configured value for a category.
    fn value(&self, category: Category) -> Option<f64> {
        match category {
            Category::Compute => self.compute,
            Category::Storage => self.storage,
            Category::Status => self.status,
            Category::Tasks => self.tasks,
            Category::Utilities => self.utilities,
            Category::Reservations => self.reservations,
        }
    }

    /// Gets the minimum interval between calls for a category.
    pub fn interval(&self, category: Category) -> Duration {
        seconds(self.value(category), DEFAULT_RATE_LIMIT)
    }

    /// Validates the rate limit configuration.
    pub fn validate(&self) -> Result<()> {
        use strum::IntoEnumIterator;

        for category in Category::iter() {
            validate_seconds(&format!("rate_limits.{category}"), self.value(category))?;
        }

        Ok(())
    }
}

/// Represents polling configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PollingConfig {
    /// The number of seconds between task status polls.
    ///
    /// Defaults to 5 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_interval: Option<f64>,
    /// The number of seconds between job state polls.
    ///
    /// Defaults to 30 seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_interval: Option<f64>,
}

impl PollingConfig {
    /// Gets the interval between task status polls.
    pub fn task_interval(&self) -> Duration {
        seconds(self.task_interval, DEFAULT_TASK_INTERVAL)
    }

    /// Gets the interval between job state polls.
    pub fn job_interval(&self) -> Duration {
        seconds(self.job_interval, DEFAULT_JOB_INTERVAL)
    }

    /// Validates the polling configuration.
    pub fn validate(&self) -> Result<()> {
        validate_seconds("polling.task_interval", self.task_interval)?;
        validate_seconds("polling.job_interval", self.job_interval)
    }
}

/// Represents how terminal task status codes are classified.
///
/// Codes below 200 are always in progress; terminal codes within the inclusive
/// success range are successful and all other terminal codes are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct TaskStatusConfig {
    /// The lowest status code considered successful.
    pub success_min: u16,
    /// The highest status code considered successful.
    pub success_max: u16,
}

impl Default for TaskStatusConfig {
    fn default() -> Self {
        Self {
            success_min: DEFAULT_SUCCESS_MIN,
            success_max: DEFAULT_SUCCESS_MAX,
        }
    }
}

impl TaskStatusConfig {
    /// Validates the task status configuration.
    pub fn validate(&self) -> Result<()> {
        if self.success_min < crate::task::TERMINAL_THRESHOLD {
            return Err(Error::Config(format!(
                "configuration value `task_status.success_min` must be at least {threshold}",
                threshold = crate::task::TERMINAL_THRESHOLD
            )));
        }

        if self.success_min > self.success_max {
            return Err(Error::Config(
                "configuration value `task_status.success_min` cannot exceed \
                 `task_status.success_max`"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Represents the strategy used to read remote files.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Stage the file through object storage and download it from the
    /// returned link.
    #[default]
    Staged,
    /// Download the file directly through the utilities endpoint.
    ///
    /// This is only suitable for small files.
    Direct,
}

/// Represents file transfer configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TransferConfig {
    /// The strategy used when fetching job output.
    #[serde(default)]
    pub mode: TransferMode,
    /// Whether object storage links are left valid after a fetch.
    #[serde(default)]
    pub keep_links: bool,
}

/// Represents HTTP configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct HttpConfig {
    /// The number of retries for idempotent requests that fail transiently.
    ///
    /// Defaults to `3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<usize>,
    /// The request timeout, in seconds.
    ///
    /// Defaults to no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl HttpConfig {
    /// Gets the number of retries for idempotent requests.
    pub fn retries(&self) -> usize {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    /// Gets the request timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(|t| seconds(Some(t), MAX_SECONDS))
    }

    /// Validates the HTTP configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeout == Some(0.0) {
            return Err(Error::Config(
                "configuration value `http.timeout` cannot be zero".to_string(),
            ));
        }

        validate_seconds("http.timeout", self.timeout)
    }
}
