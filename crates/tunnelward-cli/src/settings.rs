//! Resolution of the engine configuration from flags and environment

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tunnelward_engine::EngineConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "TUNNELWARD_CONFIG";

/// Environment variable overriding the service directory
pub const HOME_ENV: &str = "TUNNELWARD_HOME";

/// Config file to read: explicit path, else `<home>/config.yml`, else the default
pub fn resolve_config_path(explicit: Option<&Path>, home: Option<&Path>) -> PathBuf {
    match (explicit, home) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(home)) => home.join("config.yml"),
        (None, None) => EngineConfig::default_path(),
    }
}

/// Load the engine configuration; `home` wins over the file's `service_dir`
pub fn load_engine_config(explicit: Option<&Path>, home: Option<&Path>) -> Result<EngineConfig> {
    let path = resolve_config_path(explicit, home);
    let mut config = EngineConfig::load(&path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;

    if let Some(home) = home {
        config.service_dir = home.to_path_buf();
    }

    Ok(config)
}
