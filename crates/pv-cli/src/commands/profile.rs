//! `profile` subcommands

use std::path::Path;

use anyhow::{Context, Result};

use pv_core::config::{self, ProfileConfig, StaticHostConfig};
use pv_core::store::ProfileRegistry;
use pv_core::traits::KeyStore;

use crate::keys::import_key_pair;
use crate::output::{format_profile, print_info, print_success};

/// Show the current profile
pub fn profile_current(registry: &ProfileRegistry) -> Result<()> {
    match registry.current()? {
        Some(profile) => println!("{}", format_profile(&profile)),
        None => print_info("No current profile; create one with `preview profile init`"),
    }
    Ok(())
}

/// Copy a profile directory in and make it current
pub fn profile_import(registry: &ProfileRegistry, location: &Path, name: Option<&str>) -> Result<()> {
    let alias = match name {
        Some(name) => name.to_string(),
        None => location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Cannot derive a profile name from the location; use --name")?,
    };

    let info = registry
        .import(&alias, location)
        .with_context(|| format!("Failed to import profile from {:?}", location))?;
    print_success(&format!("Imported profile '{}' ({})", alias, info.id));
    Ok(())
}

/// Settings for a new static-host profile
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub alias: String,
    pub address: String,
    pub username: Option<String>,
    pub tunnel_url: Option<String>,
    /// Private key authorized on the host
    pub key_file: Option<std::path::PathBuf>,
}

/// Create a profile for a static host and make it current
pub async fn profile_init(registry: &ProfileRegistry, options: InitOptions) -> Result<()> {
    let mut profile = ProfileConfig {
        static_host: StaticHostConfig {
            address: options.address.clone(),
            ..StaticHostConfig::default()
        },
        ..ProfileConfig::default()
    };
    if let Some(username) = options.username {
        profile.static_host.username = username;
    }
    if let Some(url) = options.tunnel_url {
        profile.tunnel_url = url;
    }
    // Reject a bad URL before anything is written
    profile.tunnel_url()?;

    let store = registry
        .create(&options.alias, "static")
        .with_context(|| format!("Failed to create profile '{}'", options.alias))?;
    config::save_config(&store.config_path(), &profile)?;

    if let Some(path) = &options.key_file {
        let private_key = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {:?}", path))?;
        let key_pair = import_key_pair(&profile.static_host.key_alias, &private_key)
            .with_context(|| format!("Invalid private key in {:?}", path))?;
        store.key_store().write(&key_pair.name, &key_pair).await?;
    }

    print_success(&format!(
        "Created profile '{}' at {}",
        options.alias,
        store.root().display()
    ));
    Ok(())
}
