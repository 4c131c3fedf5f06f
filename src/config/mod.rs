//! Configuration management for the game service runtime.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support (`CONFIG_PATH` or an explicit path)
//! - Environment variable overrides (`ATAPP__SECTION__KEY`)
//! - Section-wise validation
mod app;
mod log;
mod logic;
mod router;
mod task;
pub use app::*;
pub use log::*;
pub use logic::*;
pub use router::*;
pub use task::*;
#[cfg(test)]
mod router_test;

use std::env;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Environment prefix of every override, e.g. `ATAPP__ROUTER__RETRY_MAX_TTL=5`
pub const ENV_PREFIX: &str = "ATAPP";

/// Root settings of one game service process
///
/// Combines all section configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH` or [`Settings::load`]
/// 3. Environment variables (highest priority)
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Process identity and tick cadence
    #[serde(default)]
    pub app: AppConfig,
    /// Router cache/entity lifecycle tunables
    #[serde(default)]
    pub router: RouterConfig,
    /// Task timeouts
    #[serde(default)]
    pub task: TaskConfig,
    /// Backing services of the logic layer
    #[serde(default)]
    pub logic: LogicConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Settings {
    /// Loads defaults, the file named by `CONFIG_PATH` (if set) and `ATAPP__` environment
    /// variables. Does not validate.
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Applies a TOML file on top of the current values, then environment variables again.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Full load used by the binary: layered sources, optional override file, validation.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings = Self::new()?;
        let settings = match path {
            Some(path) => settings.with_override_config(path)?,
            None => settings,
        };
        settings.validate()
    }

    pub fn validate(self) -> Result<Self> {
        self.app.validate()?;
        self.router.validate()?;
        self.task.validate()?;
        self.logic.validate()?;
        self.log.validate()?;
        Ok(self)
    }
}
