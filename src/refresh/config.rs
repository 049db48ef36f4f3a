//! Refresh cadence configuration.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Quiet period between the first interaction of a burst and the
/// last-activity update it produces.
pub const ACTIVITY_THROTTLE: Duration = Duration::from_secs(5);

/// User data is not refreshed once the user has been idle this long.
pub const INACTIVITY_CEILING: Duration = Duration::from_secs(10 * 60);

/// Namespace every auth-scoped cache key lives under.
pub const AUTH_NAMESPACE: &str = "auth";

/// Intervals and toggles for the refresh coordinator. Every field is
/// optional when deserializing; omitted fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_user_data_interval")]
    pub user_data_interval_ms: u64,
    #[serde(default = "default_permissions_interval")]
    pub permissions_interval_ms: u64,
    #[serde(default = "default_session_check_interval")]
    pub session_check_interval_ms: u64,
    #[serde(default = "default_stale_check_interval")]
    pub stale_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub enable_activity_based_refresh: bool,
    #[serde(default = "default_true")]
    pub enable_stale_data_refresh: bool,
}

fn default_user_data_interval() -> u64 {
    300_000
}

fn default_permissions_interval() -> u64 {
    120_000
}

fn default_session_check_interval() -> u64 {
    30_000
}

fn default_stale_check_interval() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            user_data_interval_ms: default_user_data_interval(),
            permissions_interval_ms: default_permissions_interval(),
            session_check_interval_ms: default_session_check_interval(),
            stale_check_interval_ms: default_stale_check_interval(),
            enable_activity_based_refresh: true,
            enable_stale_data_refresh: true,
        }
    }
}

impl RefreshConfig {
    /// Load a (possibly partial) config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn user_data_interval(&self) -> Duration {
        Duration::from_millis(self.user_data_interval_ms)
    }

    pub fn permissions_interval(&self) -> Duration {
        Duration::from_millis(self.permissions_interval_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }
}
