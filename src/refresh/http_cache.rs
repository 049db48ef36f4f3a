//! A [`QueryCache`] backed by the backend API.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::cache::{CacheError, CacheKey, CachedAuthEntry, QueryCache, RefetchType};

/// Supplies the bearer credential for backend calls.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> Result<String, CacheError>;
}

/// A fixed, externally issued token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, CacheError> {
        if self.0.is_empty() {
            return Err(CacheError::Token("empty token".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Backend path serving the data for `key`.
pub fn endpoint_for(key: &CacheKey) -> Option<String> {
    match key.segments() {
        [ns, kind, _user] if ns == "auth" && kind == "user" => {
            Some("/api/v1/auth/session".to_string())
        }
        [ns, kind, _user] if ns == "auth" && kind == "permissions" => {
            Some("/api/v1/auth/permissions".to_string())
        }
        [ns, kind, _user] if ns == "auth" && kind == "session" => {
            Some("/api/v1/auth/status".to_string())
        }
        [ns, kind, org] if ns == "auth" && kind == "organization" => {
            Some(format!("/api/v1/organizations/{}", org))
        }
        _ => None,
    }
}

struct Slot {
    data: Option<Value>,
    updated_at: Instant,
    stale_time: Duration,
}

/// Entries are created by [`observe`](Self::observe) and filled by refetches.
pub struct HttpQueryCache {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    slots: RwLock<HashMap<CacheKey, Slot>>,
}

impl HttpQueryCache {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer for `key`. Existing data is kept.
    pub fn observe(&self, key: CacheKey, stale_time: Duration) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key)
            .and_modify(|slot| slot.stale_time = stale_time)
            .or_insert(Slot {
                data: None,
                updated_at: Instant::now(),
                stale_time,
            });
    }

    fn is_observed(&self, key: &CacheKey) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    async fn fetch(&self, key: &CacheKey) -> Result<Value, CacheError> {
        let path = endpoint_for(key).ok_or_else(|| CacheError::UnknownKey(key.to_string()))?;
        let token = self.tokens.token().await?;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| CacheError::Network {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Status {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }

        response.json::<Value>().await.map_err(|e| CacheError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl QueryCache for HttpQueryCache {
    async fn refetch(&self, key: &CacheKey, refetch_type: RefetchType) -> Result<(), CacheError> {
        if refetch_type == RefetchType::Active && !self.is_observed(key) {
            debug!(event = "cache.refetch.unobserved", key = %key);
            return Ok(());
        }

        let data = self.fetch(key).await?;

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_insert(Slot {
            data: None,
            updated_at: Instant::now(),
            stale_time: Duration::ZERO,
        });
        slot.data = Some(data);
        slot.updated_at = Instant::now();
        debug!(event = "cache.refetch.completed", key = %key);
        Ok(())
    }

    fn query_data(&self, key: &CacheKey) -> Option<Value> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|slot| slot.data.clone())
    }

    fn entries(&self, namespace: &str) -> Vec<CachedAuthEntry> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.in_namespace(namespace))
            .map(|(key, slot)| CachedAuthEntry {
                key: key.clone(),
                data: slot.data.clone(),
                updated_at: slot.updated_at,
                stale_time: slot.stale_time,
            })
            .collect()
    }
}
