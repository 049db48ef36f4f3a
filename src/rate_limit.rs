//! Fixed-window request counting used to synthesize rate-limit headers
//! when the backend does not send its own.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Windows are pruned once the map grows past this many callers.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
}

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateWindows {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

/// Map key for a credential; the raw token is never stored.
fn fingerprint(credential: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(credential.as_bytes()))
}

impl RateWindows {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.requests,
            window: config.window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `credential` and report what is left.
    pub async fn hit(&self, credential: &str) -> RateLimitSnapshot {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() > PRUNE_THRESHOLD {
            let span = self.window;
            windows.retain(|_, w| now.saturating_duration_since(w.started) < span);
        }

        let window = windows.entry(fingerprint(credential)).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.saturating_duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);

        let elapsed = now.saturating_duration_since(window.started);
        RateLimitSnapshot {
            limit: self.limit,
            remaining: self.limit.saturating_sub(window.count),
            reset_secs: self.window.saturating_sub(elapsed).as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows(requests: u32, secs: u64) -> RateWindows {
        RateWindows::new(&RateLimitConfig {
            requests,
            window: Duration::from_secs(secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_down_per_credential() {
        let w = windows(3, 60);
        assert_eq!(w.hit("Bearer a").await.remaining, 2);
        assert_eq!(w.hit("Bearer a").await.remaining, 1);
        assert_eq!(w.hit("Bearer b").await.remaining, 2);
        assert_eq!(w.hit("Bearer a").await.remaining, 0);
        assert_eq!(w.hit("Bearer a").await.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let w = windows(2, 60);
        w.hit("Bearer a").await;
        w.hit("Bearer a").await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(w.hit("Bearer a").await.reset_secs, 40);

        tokio::time::advance(Duration::from_secs(41)).await;
        let snapshot = w.hit("Bearer a").await;
        assert_eq!(snapshot.remaining, 1);
        assert_eq!(snapshot.reset_secs, 60);
    }

    #[test]
    fn test_fingerprint_hides_token() {
        let fp = fingerprint("Bearer secret-token");
        assert!(!fp.contains("secret"));
        assert_eq!(fp, fingerprint("Bearer secret-token"));
    }
}
