use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Router cache/entity lifecycle tunables
///
/// Expiration thresholds and timer intervals are in seconds, retry intervals in milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConfig {
    /// A read-only cache not visited for this long is removed
    #[serde(default = "default_cache_free_timeout")]
    pub cache_free_timeout: i64,

    /// A writable entity not visited for this long is saved and downgraded
    #[serde(default = "default_object_free_timeout")]
    pub object_free_timeout: i64,

    /// Periodic save interval of writable entities
    #[serde(default = "default_object_save_interval")]
    pub object_save_interval: i64,

    #[serde(default = "default_default_timer_interval")]
    pub default_timer_interval: i64,

    /// Re-arm interval for busy objects and cache-removal follow-ups
    #[serde(default = "default_fast_timer_interval")]
    pub fast_timer_interval: i64,

    /// A cache refreshed within this window is served without pulling again
    #[serde(default = "default_cache_update_interval")]
    pub cache_update_interval: i64,

    /// Attempts of one mutate loop (values below 1 mean 1)
    #[serde(default = "default_retry_max_ttl")]
    pub retry_max_ttl: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub cache_retry_interval: u64,

    #[serde(default = "default_retry_interval_ms")]
    pub object_retry_interval: u64,

    /// Pending actions handled by one auto-save round, 0 means everything queued
    #[serde(default)]
    pub pending_action_max_count: usize,

    #[serde(default = "default_batch_count")]
    pub pending_action_batch_count: usize,

    #[serde(default = "default_batch_count")]
    pub closing_action_batch_count: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_free_timeout: default_cache_free_timeout(),
            object_free_timeout: default_object_free_timeout(),
            object_save_interval: default_object_save_interval(),
            default_timer_interval: default_default_timer_interval(),
            fast_timer_interval: default_fast_timer_interval(),
            cache_update_interval: default_cache_update_interval(),
            retry_max_ttl: default_retry_max_ttl(),
            cache_retry_interval: default_retry_interval_ms(),
            object_retry_interval: default_retry_interval_ms(),
            pending_action_max_count: 0,
            pending_action_batch_count: default_batch_count(),
            closing_action_batch_count: default_batch_count(),
        }
    }
}

impl RouterConfig {
    pub fn retry_max_ttl(&self) -> u32 {
        self.retry_max_ttl.max(1)
    }

    pub fn cache_retry_interval(&self) -> Duration {
        Duration::from_millis(self.cache_retry_interval)
    }

    pub fn object_retry_interval(&self) -> Duration {
        Duration::from_millis(self.object_retry_interval)
    }

    pub fn pending_action_batch_count(&self) -> usize {
        self.pending_action_batch_count.max(1)
    }

    pub fn closing_action_batch_count(&self) -> usize {
        self.closing_action_batch_count.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("router.cache_free_timeout", self.cache_free_timeout),
            ("router.object_free_timeout", self.object_free_timeout),
            ("router.object_save_interval", self.object_save_interval),
            ("router.default_timer_interval", self.default_timer_interval),
            ("router.fast_timer_interval", self.fast_timer_interval),
        ];
        for (key, value) in positive {
            if value <= 0 {
                return Err(Error::Config(ConfigError::Message(format!(
                    "{key} must be > 0, got {value}"
                ))));
            }
        }

        if self.cache_update_interval < 0 {
            return Err(Error::Config(ConfigError::Message(
                "router.cache_update_interval must not be negative".into(),
            )));
        }

        if self.fast_timer_interval > self.default_timer_interval {
            return Err(Error::Config(ConfigError::Message(format!(
                "router.fast_timer_interval ({}) must not exceed router.default_timer_interval ({})",
                self.fast_timer_interval, self.default_timer_interval
            ))));
        }

        if self.object_save_interval > self.object_free_timeout {
            return Err(Error::Config(ConfigError::Message(format!(
                "router.object_save_interval ({}) must not exceed router.object_free_timeout ({})",
                self.object_save_interval, self.object_free_timeout
            ))));
        }

        Ok(())
    }
}

fn default_cache_free_timeout() -> i64 {
    600
}
fn default_object_free_timeout() -> i64 {
    1800
}
fn default_object_save_interval() -> i64 {
    600
}
fn default_default_timer_interval() -> i64 {
    60
}
fn default_fast_timer_interval() -> i64 {
    5
}
fn default_cache_update_interval() -> i64 {
    1800
}
fn default_retry_max_ttl() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    512
}
fn default_batch_count() -> usize {
    20
}
