//! `steploop config`: show the effective configuration.

use std::path::Path;
use steploop_config::LoopConfig;

pub fn show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    print!("{}", config.to_toml());
    Ok(())
}

pub fn path(config_path: Option<&Path>) {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => LoopConfig::config_dir().join("config.toml"),
    };
    println!("{}", path.display());
}
