//! CLI command implementations

mod profile;
mod ssh;
mod up;

use anyhow::{Context, Result};

use pv_core::config::{self, ProfileConfig};
use pv_core::store::FsProfileStore;

pub use profile::{profile_current, profile_import, profile_init, InitOptions};
pub use ssh::ssh_command;
pub use up::{up_command, UpOptions};

/// The profile's settings, or defaults when it has none yet
fn load_profile_config(store: &FsProfileStore) -> Result<ProfileConfig> {
    let path = store.config_path();
    if !path.exists() {
        return Ok(ProfileConfig::default());
    }
    config::load_config(&path).with_context(|| format!("Failed to load profile config {:?}", path))
}
