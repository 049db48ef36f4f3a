//! Shared application state for the gateway.

use std::sync::Arc;

use crate::config::{ConfigError, ProxyConfig};
use crate::rate_limit::RateWindows;
use crate::webhook::WebhookVerifier;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub client: reqwest::Client,
    pub webhook: Option<Arc<WebhookVerifier>>,
    pub rate_windows: Arc<RateWindows>,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.backend_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let webhook = config
            .webhook_secret
            .as_deref()
            .map(WebhookVerifier::new)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            rate_windows: Arc::new(RateWindows::new(&config.rate_limit)),
            config: Arc::new(config),
            client,
            webhook,
        })
    }
}
