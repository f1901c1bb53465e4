//! CLI command implementations.

pub mod config_cmd;
pub mod run;
pub mod tools;

use std::path::Path;
use steploop_config::{ConfigError, LoopConfig};

/// Load the config from `path` (or the default location), env overrides applied.
pub fn load_config(path: Option<&Path>) -> Result<LoopConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = LoopConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => LoopConfig::load(),
    }
}
