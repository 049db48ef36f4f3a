//! The query cache the coordinator drives.
//!
//! The cache owns its entries. The coordinator only reads them and asks for
//! refetches; it never writes an entry itself.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::config::AUTH_NAMESPACE;

/// Segmented cache key, e.g. `auth:user:user_123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn user(user_id: &str) -> Self {
        Self::new([AUTH_NAMESPACE, "user", user_id])
    }

    pub fn permissions(user_id: &str) -> Self {
        Self::new([AUTH_NAMESPACE, "permissions", user_id])
    }

    pub fn organization(org_id: &str) -> Self {
        Self::new([AUTH_NAMESPACE, "organization", org_id])
    }

    pub fn session(user_id: &str) -> Self {
        Self::new([AUTH_NAMESPACE, "session", user_id])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether the first segment equals `namespace`.
    pub fn in_namespace(&self, namespace: &str) -> bool {
        self.0.first().is_some_and(|s| s == namespace)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(":"))
    }
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone)]
pub struct CachedAuthEntry {
    pub key: CacheKey,
    pub data: Option<Value>,
    pub updated_at: Instant,
    pub stale_time: Duration,
}

impl CachedAuthEntry {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.updated_at) > self.stale_time
    }
}

/// Which entries a refetch applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchType {
    /// Only entries with a live observer.
    Active,
    All,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("network error fetching {key}: {message}")]
    Network { key: String, message: String },

    #[error("backend returned {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("could not obtain a session token: {0}")]
    Token(String),

    #[error("invalid payload for {key}: {message}")]
    Decode { key: String, message: String },

    #[error("no endpoint for cache key {0}")]
    UnknownKey(String),
}

/// Key-indexed async cache with per-entry staleness.
#[async_trait]
pub trait QueryCache: Send + Sync + 'static {
    /// Refresh one entry. Resolves once the fetch has landed or failed.
    async fn refetch(&self, key: &CacheKey, refetch_type: RefetchType) -> Result<(), CacheError>;

    /// Current cached value, if any.
    fn query_data(&self, key: &CacheKey) -> Option<Value>;

    /// Every tracked entry whose key lives under `namespace`.
    fn entries(&self, namespace: &str) -> Vec<CachedAuthEntry>;

    /// Entries under `namespace` that are stale at `now` and hold data.
    fn stale_entries(&self, namespace: &str, now: Instant) -> Vec<CachedAuthEntry> {
        self.entries(namespace)
            .into_iter()
            .filter(|entry| entry.data.is_some() && entry.is_stale(now))
            .collect()
    }
}
