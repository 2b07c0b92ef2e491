use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::crypto::{SealError, TokenSealer};

pub const DB_PATH_ENV: &str = "MAILROOM_DB";
pub const CLIENT_ID_ENV: &str = "MAILROOM_GOOGLE_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "MAILROOM_GOOGLE_CLIENT_SECRET";
pub const TOKEN_URL_ENV: &str = "MAILROOM_TOKEN_URL";
pub const GMAIL_API_BASE_ENV: &str = "MAILROOM_GMAIL_API_BASE";
pub const HTTP_TIMEOUT_ENV: &str = "MAILROOM_HTTP_TIMEOUT_SECS";
pub const TOKEN_KEY_ENV: &str = "MAILROOM_TOKEN_KEY";

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MAILROOM_TOKEN_KEY: {0}")]
    TokenKey(#[from] SealError),

    #[error("MAILROOM_HTTP_TIMEOUT_SECS must be a positive number of seconds, got '{0}'")]
    Timeout(String),
}

/// OAuth client registration used for refresh-token exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub oauth_client: Option<OAuthClient>,
    pub token_url: String,
    pub gmail_api_base: String,
    pub http_timeout: Duration,
    pub token_sealer: Option<TokenSealer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            oauth_client: None,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            gmail_api_base: DEFAULT_GMAIL_API_BASE.to_string(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            token_sealer: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves configuration through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let oauth_client = match (read(CLIENT_ID_ENV), read(CLIENT_SECRET_ENV)) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClient {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let http_timeout = match read(HTTP_TIMEOUT_ENV) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::Timeout(raw)),
            },
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let token_sealer = read(TOKEN_KEY_ENV)
            .map(|raw| TokenSealer::from_hex(&raw))
            .transpose()?;

        Ok(Self {
            db_path: read(DB_PATH_ENV).map(PathBuf::from),
            oauth_client,
            token_url: read(TOKEN_URL_ENV).unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            gmail_api_base: read(GMAIL_API_BASE_ENV)
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_GMAIL_API_BASE.to_string()),
            http_timeout,
            token_sealer,
        })
    }
}
