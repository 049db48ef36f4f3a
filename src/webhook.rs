//! Svix signature verification for identity-provider webhooks.
//!
//! Signed content is `"{svix-id}.{svix-timestamp}.{body}"`, HMAC-SHA256
//! keyed with the base64 secret (after its `whsec_` prefix). The
//! `svix-signature` header carries space-separated `v1,<base64>` entries;
//! any one matching accepts the payload.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the signer and us.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 5 * 60;

pub const SVIX_ID: &str = "svix-id";
pub const SVIX_TIMESTAMP: &str = "svix-timestamp";
pub const SVIX_SIGNATURE: &str = "svix-signature";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Missing webhook headers")]
    MissingHeaders,

    #[error("Invalid webhook signature")]
    InvalidSignature,
}

pub struct WebhookVerifier {
    keyed: HmacSha256,
}

impl WebhookVerifier {
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        let encoded = secret.trim().trim_start_matches("whsec_");
        let key = STANDARD
            .decode(encoded)
            .map_err(|e| ConfigError::InvalidValue {
                key: "CLERK_WEBHOOK_SECRET".to_string(),
                message: e.to_string(),
            })?;
        if key.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CLERK_WEBHOOK_SECRET".to_string(),
                message: "secret is empty".to_string(),
            });
        }
        let keyed = HmacSha256::new_from_slice(&key).map_err(|e| ConfigError::InvalidValue {
            key: "CLERK_WEBHOOK_SECRET".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { keyed })
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        mac
    }

    /// Base64 signature for the given message parts.
    pub fn sign(&self, id: &str, timestamp: &str, body: &[u8]) -> String {
        STANDARD.encode(self.mac(id, timestamp, body).finalize().into_bytes())
    }

    /// Check the svix headers against `body`. `now` is unix seconds.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), WebhookError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let (Some(id), Some(timestamp), Some(signatures)) =
            (header(SVIX_ID), header(SVIX_TIMESTAMP), header(SVIX_SIGNATURE))
        else {
            return Err(WebhookError::MissingHeaders);
        };

        let sent_at: i64 = timestamp.parse().map_err(|_| WebhookError::InvalidSignature)?;
        if now.abs_diff(sent_at) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
            return Err(WebhookError::InvalidSignature);
        }

        let mac = self.mac(id, timestamp, body);
        let matched = signatures
            .split_whitespace()
            .filter_map(|entry| entry.split_once(','))
            .filter(|(version, _)| *version == "v1")
            .filter_map(|(_, sig)| STANDARD.decode(sig).ok())
            .any(|sig| mac.clone().verify_slice(&sig).is_ok());

        if matched {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}
