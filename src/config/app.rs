use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Logic id of this process. Entities whose router server id differs are not writable here.
    #[serde(default = "default_app_id")]
    pub id: u64,

    #[serde(default = "default_app_name")]
    pub name: String,

    /// Period of the tick driving the router manager set (unit: milliseconds)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            id: default_app_id(),
            name: default_app_name(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl AppConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::Config(ConfigError::Message("app.id must be > 0".into())));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "app.tick_interval_ms must be > 0".into(),
            )));
        }
        Ok(())
    }
}

fn default_app_id() -> u64 {
    1
}
fn default_app_name() -> String {
    "gamesvr".to_string()
}
fn default_tick_interval_ms() -> u64 {
    100
}
