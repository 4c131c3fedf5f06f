use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskConfig {
    /// Tasks started by a client message
    #[serde(default)]
    pub csmsg: TaskTimeoutConfig,

    /// Background tasks (sub-tasks, auto-save, shutdown)
    #[serde(default = "TaskTimeoutConfig::nomsg")]
    pub nomsg: TaskTimeoutConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct TaskTimeoutConfig {
    /// Unit: milliseconds. Zero disables the timer.
    #[serde(default = "default_csmsg_timeout_ms")]
    pub timeout: u64,
}

impl Default for TaskTimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: default_csmsg_timeout_ms(),
        }
    }
}

impl TaskTimeoutConfig {
    fn nomsg() -> Self {
        Self {
            timeout: default_nomsg_timeout_ms(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }
}

impl TaskConfig {
    pub fn csmsg_timeout(&self) -> Option<Duration> {
        self.csmsg.duration()
    }

    pub fn nomsg_timeout(&self) -> Option<Duration> {
        self.nomsg.duration()
    }

    pub fn validate(&self) -> Result<()> {
        if self.csmsg.timeout == 0 {
            return Err(Error::Config(ConfigError::Message(
                "task.csmsg.timeout must be > 0".into(),
            )));
        }
        Ok(())
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            csmsg: TaskTimeoutConfig::default(),
            nomsg: TaskTimeoutConfig::nomsg(),
        }
    }
}

fn default_csmsg_timeout_ms() -> u64 {
    8000
}
fn default_nomsg_timeout_ms() -> u64 {
    15000
}
