//! Gateway configuration loaded from the environment.

use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub backend_url: String,
    pub allowed_origins: Vec<String>,
    pub webhook_secret: Option<String>,
    pub backend_timeout: Duration,
    pub rate_limit: RateLimitConfig,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origins: String = try_load(&lookup, "ALLOWED_ORIGINS", "http://localhost:3000")?;
        let backend_url: String = try_load(&lookup, "BACKEND_URL", "http://localhost:8000")?;

        Ok(Self {
            port: try_load(&lookup, "GATEWAY_PORT", "3000")?,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            allowed_origins: parse_origins(&origins),
            webhook_secret: lookup("CLERK_WEBHOOK_SECRET").filter(|s| !s.trim().is_empty()),
            backend_timeout: Duration::from_millis(try_load(
                &lookup,
                "BACKEND_TIMEOUT_MS",
                "30000",
            )?),
            rate_limit: RateLimitConfig {
                requests: try_load(&lookup, "RATE_LIMIT_REQUESTS", "10")?,
                window: Duration::from_secs(try_load(&lookup, "RATE_LIMIT_WINDOW_SECS", "3600")?),
            },
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

fn try_load<T, F>(lookup: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!(
            event = "config.default",
            key = key,
            default = default,
            "Variable not set, using default"
        );
        default.to_string()
    });
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
