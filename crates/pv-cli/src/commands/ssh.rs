//! `ssh`: open a shell (or run a command) on an environment's machine

use std::io::Write;

use anyhow::{bail, Context, Result};

use pv_core::store::FsProfileStore;
use pv_core::traits::{KeyStore, MachineDriver};

use crate::driver::StaticHostDriver;

use super::load_profile_config;

/// Execute the ssh command and return the exit code of `ssh`
pub async fn ssh_command(store: &FsProfileStore, env_id: &str, args: &[String]) -> Result<i32> {
    let config = load_profile_config(store)?;
    let driver = StaticHostDriver::new(config.static_host)?;

    let machine = driver
        .get_machine(env_id)
        .await?
        .with_context(|| format!("No machine found for environment '{}'", env_id))?;

    let alias = driver.key_pair_alias();
    let Some(key_pair) = store.key_store().read(&alias).await? else {
        bail!("SSH key '{}' not found for connecting to machine", alias);
    };

    // Created with mode 0600 and removed once ssh exits
    let mut key_file = tempfile::Builder::new()
        .prefix("preview-ssh-")
        .tempfile()
        .context("Failed to create key file")?;
    key_file.write_all(key_pair.private_key.as_bytes())?;
    key_file.flush()?;

    let status = tokio::process::Command::new("ssh")
        .arg("-i")
        .arg(key_file.path())
        .args(ssh_options())
        .arg(format!("{}@{}", machine.ssh_username, machine.public_address))
        .args(args)
        .status()
        .await
        .context("Failed to run ssh")?;

    Ok(status.code().unwrap_or(1))
}

fn ssh_options() -> [&'static str; 6] {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
    ]
}
