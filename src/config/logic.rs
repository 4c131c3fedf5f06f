use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_RECORD_PREFIX;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LogicConfig {
    #[serde(default)]
    pub redis: RedisConfig,
}

impl LogicConfig {
    pub fn validate(&self) -> Result<()> {
        self.redis.validate()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace put in front of every record key
    #[serde(default = "default_record_prefix")]
    pub record_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            record_prefix: default_record_prefix(),
        }
    }
}

impl RedisConfig {
    /// Prefix actually used for keys; an empty value falls back to `default`.
    pub fn effective_record_prefix(&self) -> &str {
        if self.record_prefix.is_empty() {
            DEFAULT_RECORD_PREFIX
        } else {
            &self.record_prefix
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("redis://")
            && !self.url.starts_with("rediss://")
            && !self.url.starts_with("redis+unix://")
            && !self.url.starts_with("unix://")
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "logic.redis.url has unsupported scheme: {}",
                self.url
            ))));
        }
        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}
fn default_record_prefix() -> String {
    DEFAULT_RECORD_PREFIX.to_string()
}
