use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use stash::DEFAULT_TTL;

/// Timing knobs for the synchronizers. Every field has a default, so a partial JSON object
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last change event before a refresh runs.
    pub debounce_ms: u64,
    /// Compare counts with the backend after serving from cache.
    pub verify_in_background: bool,
    pub cache_ttl_hours: i64,
    pub subscribe_timeout_ms: u64,
    /// Base delay between reconnect attempts; attempt `n` waits `n` times this long.
    pub reconnect_delay_ms: u64,
    /// Consecutive failed subscribe attempts before a channel switches to polling.
    pub max_reconnect_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            verify_in_background: true,
            cache_ttl_hours: 24,
            subscribe_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            max_reconnect_attempts: 5,
            poll_interval_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Falls back to the default TTL when the configured hours do not fit a `TimeDelta`.
    pub fn cache_ttl(&self) -> TimeDelta {
        TimeDelta::try_hours(self.cache_ttl_hours).unwrap_or_else(|| {
            log::warn!(
                "cache_ttl_hours = {} is out of range, using {} hours",
                self.cache_ttl_hours,
                DEFAULT_TTL.num_hours()
            );
            DEFAULT_TTL
        })
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"debounce_ms": 250, "max_reconnect_attempts": 2}"#)
            .unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(), TimeDelta::hours(24));
    }

    #[test]
    fn test_out_of_range_ttl_falls_back_to_default() {
        let config = SyncConfig::from_json(r#"{"cache_ttl_hours": 9000000000000000}"#).unwrap();
        assert_eq!(config.cache_ttl(), DEFAULT_TTL);

        let config = SyncConfig::from_json(r#"{"cache_ttl_hours": -9000000000000000}"#).unwrap();
        assert_eq!(config.cache_ttl(), DEFAULT_TTL);
    }

    #[test]
    fn test_reconnect_backoff_is_linear() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(config.reconnect_delay(3), Duration::from_secs(6));
    }
}
