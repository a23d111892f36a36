//! Configuration for the agent and for CLI profiles
//!
//! Both are TOML files. Every field has a default, so a partial file is
//! valid; `AgentConfig::validate` checks what the agent cannot run without.

mod agent;
mod profile;
pub mod serde_utils;

pub use agent::AgentConfig;
pub use profile::{ProfileConfig, StaticHostConfig};

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::ConfigError;

/// `<config dir>/preview`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("preview")
}

/// Directory holding one subdirectory per profile
pub fn default_profiles_dir() -> PathBuf {
    default_config_dir().join("profiles")
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a TOML config file
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(io_error(path)(e)),
    };
    Ok(toml::from_str(&content)?)
}

/// Write a TOML config file, creating its directory
pub fn save_config<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    std::fs::write(path, content).map_err(io_error(path))
}
