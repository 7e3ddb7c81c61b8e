//! Server configuration module.
//!
//! Parses configuration from environment variables for the VoiceHub server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `VOICEHUB_SUPABASE_URL` | Yes | - | URL of the Supabase project |
//! | `VOICEHUB_SUPABASE_ANON_KEY` | Yes | - | Supabase anon/public key |
//! | `VOICEHUB_SUPABASE_SERVICE_KEY` | No | anon key | Service-role key for table access |
//! | `VOICEHUB_JWT_SECRET` | Yes | - | HS256 signing secret (at least 32 bytes) |
//! | `VOICEHUB_JWT_ACCESS_TTL_SECS` | No | 3600 | Access token lifetime |
//! | `VOICEHUB_JWT_REFRESH_TTL_SECS` | No | 2592000 | Refresh token lifetime |
//! | `VOICEHUB_RATE_LIMIT_SALT` | No | `default_salt` | Salt mixed into hashed rate-limit keys |
//! | `VOICEHUB_FIELD_ENCRYPTION_KEY` | No | random | Base64 AES-256 key for encrypted columns |
//! | `VOICEHUB_LIVEKIT_URL` | No* | - | LiveKit server URL |
//! | `VOICEHUB_LIVEKIT_API_KEY` | No* | - | LiveKit API key |
//! | `VOICEHUB_LIVEKIT_API_SECRET` | No* | - | LiveKit API secret |
//! | `VOICEHUB_AUDIO_BUCKET` | No | `audio` | Storage bucket for turn audio |
//! | `VOICEHUB_FILES_BUCKET` | No | `files` | Storage bucket for user files |
//! | `VOICEHUB_TRUSTED_PROXIES` | No | - | Comma-separated proxy IPs whose `X-Forwarded-For` is honoured |
//! | `PORT` | No | 8080 | HTTP server port |
//!
//! *The three LiveKit variables must be set together; voice is disabled otherwise.

use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default access token lifetime (1 hour).
const DEFAULT_ACCESS_TTL_SECS: u64 = 3600;

/// Default refresh token lifetime (30 days).
const DEFAULT_REFRESH_TTL_SECS: u64 = 30 * 24 * 3600;

/// Salt used when `VOICEHUB_RATE_LIMIT_SALT` is not set.
const DEFAULT_RATE_LIMIT_SALT: &str = "default_salt";

/// Minimum accepted length of the JWT signing secret in bytes.
const MIN_JWT_SECRET_LEN: usize = 32;

/// Length of the field encryption key in bytes.
pub const FIELD_KEY_LEN: usize = 32;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// LiveKit credentials used to mint room access tokens.
#[derive(Clone)]
pub struct LiveKitConfig {
    /// WebSocket URL handed to clients (e.g. `wss://project.livekit.cloud`).
    pub url: String,

    /// API key, used as the token issuer.
    pub api_key: String,

    /// API secret, used as the HS256 signing key.
    pub api_secret: String,
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    pub supabase_url: String,

    /// Supabase anon/public key, used for auth endpoints.
    pub supabase_anon_key: String,

    /// Supabase service-role key, used for table, RPC and storage calls.
    pub supabase_service_key: String,

    /// Secret for signing access and refresh tokens.
    pub jwt_secret: String,

    /// Lifetime of access tokens.
    pub access_token_ttl: Duration,

    /// Lifetime of refresh tokens.
    pub refresh_token_ttl: Duration,

    /// Salt for hashing rate-limit keys.
    pub rate_limit_salt: String,

    /// Key for encrypting sensitive columns. `None` means a per-process key.
    pub field_encryption_key: Option<[u8; FIELD_KEY_LEN]>,

    /// LiveKit settings; `None` disables the voice endpoints.
    pub livekit: Option<LiveKitConfig>,

    /// Storage bucket for conversation audio.
    pub audio_bucket: String,

    /// Storage bucket for user files.
    pub files_bucket: String,

    /// Peers allowed to report the client address in `X-Forwarded-For`.
    /// Empty means the header is ignored.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Config {
    /// Creates a configuration with default values for everything except the
    /// Supabase connection and the JWT secret.
    pub fn new(
        supabase_url: impl Into<String>,
        supabase_anon_key: impl Into<String>,
        jwt_secret: impl Into<String>,
    ) -> Self {
        let supabase_anon_key = supabase_anon_key.into();
        Self {
            port: DEFAULT_PORT,
            supabase_url: supabase_url.into(),
            supabase_service_key: supabase_anon_key.clone(),
            supabase_anon_key,
            jwt_secret: jwt_secret.into(),
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TTL_SECS),
            rate_limit_salt: DEFAULT_RATE_LIMIT_SALT.to_string(),
            field_encryption_key: None,
            livekit: None,
            audio_bucket: "audio".to_string(),
            files_bucket: "files".to_string(),
            trusted_proxies: Vec::new(),
        }
    }

    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - The JWT secret is shorter than 32 bytes
    ///
    /// # Example
    ///
    /// ```no_run
    /// use voicehub_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let supabase_url = require_env("VOICEHUB_SUPABASE_URL")?;
        let supabase_anon_key = require_env("VOICEHUB_SUPABASE_ANON_KEY")?;
        let supabase_service_key = optional_env("VOICEHUB_SUPABASE_SERVICE_KEY")
            .unwrap_or_else(|| supabase_anon_key.clone());
        let jwt_secret = require_env("VOICEHUB_JWT_SECRET")?;

        let config = Self {
            port,
            supabase_url,
            supabase_anon_key,
            supabase_service_key,
            jwt_secret,
            access_token_ttl: parse_secs_env(
                "VOICEHUB_JWT_ACCESS_TTL_SECS",
                DEFAULT_ACCESS_TTL_SECS,
            )?,
            refresh_token_ttl: parse_secs_env(
                "VOICEHUB_JWT_REFRESH_TTL_SECS",
                DEFAULT_REFRESH_TTL_SECS,
            )?,
            rate_limit_salt: optional_env("VOICEHUB_RATE_LIMIT_SALT")
                .unwrap_or_else(|| DEFAULT_RATE_LIMIT_SALT.to_string()),
            field_encryption_key: parse_field_key()?,
            livekit: parse_livekit()?,
            audio_bucket: optional_env("VOICEHUB_AUDIO_BUCKET")
                .unwrap_or_else(|| "audio".to_string()),
            files_bucket: optional_env("VOICEHUB_FILES_BUCKET")
                .unwrap_or_else(|| "files".to_string()),
            trusted_proxies: parse_trusted_proxies()?,
        };

        config.validate()?;

        if config.field_encryption_key.is_none() {
            warn!(
                "VOICEHUB_FIELD_ENCRYPTION_KEY is not set - using a random key. \
                 Encrypted fields will be unreadable after a restart!"
            );
        }

        if config.rate_limit_salt == DEFAULT_RATE_LIMIT_SALT {
            warn!("VOICEHUB_RATE_LIMIT_SALT is not set - using the default salt");
        }

        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::ValidationError(format!(
                "VOICEHUB_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }

        if self.access_token_ttl >= self.refresh_token_ttl {
            return Err(ConfigError::ValidationError(
                "access token lifetime must be shorter than refresh token lifetime".to_string(),
            ));
        }

        if !self.supabase_url.starts_with("http://") && !self.supabase_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidFormat {
                var: "VOICEHUB_SUPABASE_URL".to_string(),
                message: "must start with http:// or https://".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("supabase_url", &self.supabase_url)
            .field("supabase_anon_key", &"<redacted>")
            .field("supabase_service_key", &"<redacted>")
            .field("jwt_secret", &"<redacted>")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("field_encryption_key", &self.field_encryption_key.map(|_| "<redacted>"))
            .field("livekit", &self.livekit)
            .field("audio_bucket", &self.audio_bucket)
            .field("files_bucket", &self.files_bucket)
            .field("trusted_proxies", &self.trusted_proxies)
            .finish()
    }
}

/// Read a required, non-empty environment variable.
fn require_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Read an optional environment variable, treating empty values as unset.
fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a duration given in whole seconds.
fn parse_secs_env(name: &str, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = optional_env(name) else {
        return Ok(Duration::from_secs(default));
    };

    match raw.parse::<u64>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a positive number of seconds, got '{raw}'"),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
    }
}

/// Parse the base64-encoded field encryption key.
fn parse_field_key() -> Result<Option<[u8; FIELD_KEY_LEN]>, ConfigError> {
    let Some(raw) = optional_env("VOICEHUB_FIELD_ENCRYPTION_KEY") else {
        return Ok(None);
    };

    let bytes = STANDARD
        .decode(raw.as_bytes())
        .map_err(|e| ConfigError::InvalidFormat {
            var: "VOICEHUB_FIELD_ENCRYPTION_KEY".to_string(),
            message: format!("invalid base64: {e}"),
        })?;

    let key: [u8; FIELD_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| ConfigError::InvalidFormat {
                var: "VOICEHUB_FIELD_ENCRYPTION_KEY".to_string(),
                message: format!("expected {FIELD_KEY_LEN} bytes, got {}", bytes.len()),
            })?;

    Ok(Some(key))
}

/// Parse the comma-separated list of trusted proxy addresses.
fn parse_trusted_proxies() -> Result<Vec<IpAddr>, ConfigError> {
    let Some(raw) = optional_env("VOICEHUB_TRUSTED_PROXIES") else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse::<IpAddr>().map_err(|_| ConfigError::InvalidFormat {
                var: "VOICEHUB_TRUSTED_PROXIES".to_string(),
                message: format!("'{entry}' is not an IP address"),
            })
        })
        .collect()
}

/// Parse the LiveKit settings. All three variables or none.
fn parse_livekit() -> Result<Option<LiveKitConfig>, ConfigError> {
    let url = optional_env("VOICEHUB_LIVEKIT_URL");
    let api_key = optional_env("VOICEHUB_LIVEKIT_API_KEY");
    let api_secret = optional_env("VOICEHUB_LIVEKIT_API_SECRET");

    match (url, api_key, api_secret) {
        (None, None, None) => Ok(None),
        (Some(url), Some(api_key), Some(api_secret)) => Ok(Some(LiveKitConfig {
            url,
            api_key,
            api_secret,
        })),
        (url, api_key, _) => {
            let missing = if url.is_none() {
                "VOICEHUB_LIVEKIT_URL"
            } else if api_key.is_none() {
                "VOICEHUB_LIVEKIT_API_KEY"
            } else {
                "VOICEHUB_LIVEKIT_API_SECRET"
            };
            Err(ConfigError::MissingEnvVar(missing.to_string()))
        }
    }
}
