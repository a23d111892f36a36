//! `up`: provision the machine, deploy the compose project and print the
//! tunnel URLs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinHandle;

use pv_agent::ssh::{SshConnector, SshOptions, SshSession};
use pv_core::config::ProfileConfig;
use pv_core::error::SessionError;
use pv_core::shell;
use pv_core::store::FsProfileStore;
use pv_core::traits::RemoteSession;
use pv_core::types::{CommandOutput, FileToCopy, TunnelResult};
use pv_core::RetryPolicy;
use pv_protocol::ssh_url::DEFAULT_SSH_PORT;

use crate::compose::{
    self, AgentService, ComposeProject, RemoteCompose, AGENT_KEY_FILE, AGENT_KNOWN_KEYS_DIR,
    OVERRIDE_FILE, REMOTE_DIR_BASE,
};
use crate::driver::StaticHostDriver;
use crate::keys::generate_key_pair;
use crate::output::{format_tunnels, print_info, print_success, print_warning};
use crate::provision::MachineProvisioner;
use crate::tunnels::{AgentEndpoint, TunnelQueryClient};

use super::load_profile_config;

/// What to bring up
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub compose_files: Vec<PathBuf>,
    pub project: Option<String>,
    pub env_id: Option<String>,
    /// Services to start; empty means all
    pub services: Vec<String>,
}

/// Execute the up command
pub async fn up_command(store: &FsProfileStore, options: UpOptions) -> Result<()> {
    let config = load_profile_config(store)?;

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let files = compose::find_compose_files(&options.compose_files, &cwd)?;
    let project = compose::resolve_project(files, options.project.as_deref()).await?;
    let env_id = options
        .env_id
        .clone()
        .unwrap_or_else(|| project.name.clone());
    print_info(&format!("Using environment id: {}", env_id));

    let staging = tempfile::tempdir().context("Failed to create staging directory")?;
    let files_to_copy = stage_files(staging.path(), store, &config, &project, &env_id)?;

    let driver = Arc::new(StaticHostDriver::new(config.static_host.clone())?);
    let connector = SshConnector::new(SshOptions {
        env_id: env_id.clone(),
        ..SshOptions::default()
    });
    let provisioner = MachineProvisioner::new(driver, Arc::new(store.key_store()), connector)
        .with_ssh_retry(config.ssh_retry.clone());

    print_info("Provisioning machine...");
    let provisioned = provisioner
        .provision(&env_id)
        .await
        .map_err(|e| anyhow!("Provisioning failed during {}: {}", e.phase(), e))?;
    print_success(&format!(
        "Machine {} ready ({})",
        provisioned.machine().public_address,
        provisioned.outcome
    ));

    let deployed = deploy(
        &provisioned.session,
        &project,
        &files_to_copy,
        &options.services,
        &config,
    )
    .await;
    provisioned.session.dispose().await;

    if let Some(snapshot) = provisioned.snapshot {
        wait_for_snapshot(snapshot).await;
    }

    let tunnels = deployed?;
    println!("{}", format_tunnels(&tunnels));
    Ok(())
}

/// Wait for the background snapshot. Its own failures are logged by the
/// task; a panic only shows up here. Returns whether it ran to completion.
async fn wait_for_snapshot(snapshot: JoinHandle<()>) -> bool {
    match snapshot.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Machine snapshot task did not complete: {}", e);
            false
        }
    }
}

/// Write the generated files next to copies of the compose files
fn stage_files(
    dir: &Path,
    store: &FsProfileStore,
    config: &ProfileConfig,
    project: &ComposeProject,
    env_id: &str,
) -> Result<Vec<FileToCopy>> {
    let mut files: Vec<FileToCopy> = project
        .files
        .iter()
        .zip(project.remote_file_names())
        .map(|(local, remote)| FileToCopy::new(local, remote))
        .collect();

    let tunnel_url = config.tunnel_url()?;
    let port = (tunnel_url.port != DEFAULT_SSH_PORT).then_some(tunnel_url.port);
    let known_keys = store.known_server_public_keys(&tunnel_url.host, port)?;
    if known_keys.is_empty() {
        print_warning(&format!(
            "No known host keys for {}; the agent will not verify the tunnel server",
            tunnel_url
        ));
    }

    let agent = AgentService {
        image: config.agent_image.clone(),
        env_id: env_id.to_string(),
        project: project.name.clone(),
        tunnel_url: config.tunnel_url.clone(),
        default_access: config.default_access,
        insecure_skip_host_key: known_keys.is_empty(),
    };

    let mut write = |name: &str, content: &[u8]| -> Result<()> {
        let local = dir.join(name);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&local, content).with_context(|| format!("Failed to write {:?}", local))?;
        files.push(FileToCopy::new(local, name));
        Ok(())
    };

    write(
        OVERRIDE_FILE,
        serde_json::to_string_pretty(&agent.override_model())?.as_bytes(),
    )?;
    write(AGENT_KEY_FILE, tunneling_key(store)?.as_bytes())?;
    if !known_keys.is_empty() {
        let mut content = known_keys.join("\n");
        content.push('\n');
        write(
            &format!("{}/{}", AGENT_KNOWN_KEYS_DIR, tunnel_url.host),
            content.as_bytes(),
        )?;
    }

    Ok(files)
}

/// The profile's tunnel client key, created on first use
fn tunneling_key(store: &FsProfileStore) -> Result<String> {
    if let Some(key) = store.tunneling_key()? {
        return Ok(key);
    }
    let key_pair = generate_key_pair("tunneling").context("Failed to generate tunneling key")?;
    store.set_tunneling_key(&key_pair.private_key)?;
    tracing::info!("Created tunneling key {}", key_pair.public_key);
    Ok(key_pair.private_key)
}

async fn deploy(
    session: &SshSession,
    project: &ComposeProject,
    files: &[FileToCopy],
    services: &[String],
    config: &ProfileConfig,
) -> Result<TunnelResult> {
    let remote_dir = project.remote_dir();
    run_checked(
        session,
        &format!(
            "sudo mkdir -p {dir} && sudo chown \"$USER\":docker {dir}",
            dir = shell::quote(&remote_dir)
        ),
    )
    .await?;

    print_info("Copying files...");
    copy_files_in_place(session, &remote_dir, files).await?;

    print_info("Starting services...");
    let compose = RemoteCompose::new(project);
    let up = compose.up(services);
    let output = RetryPolicy::pipe_error()
        .retry_if(
            "compose up",
            || session.exec_command(&up),
            SessionError::is_broken_pipe,
        )
        .await
        .map_err(|e| e.into_inner())?;
    check_exit("docker compose up", &output)?;
    tracing::debug!("compose up: {}", output.stderr.trim());

    let port_output = run_checked(session, &compose.agent_port()).await?;
    let (host, port) = compose::parse_published_port(&port_output.stdout).with_context(|| {
        format!(
            "Unexpected docker compose port output: {:?}",
            port_output.stdout
        )
    })?;

    let forward = session.forward_local(&host, port).await?;
    let endpoint = AgentEndpoint::new(format!("http://{}", forward.local_addr()))?;

    print_info("Getting tunnels...");
    let tunnels = TunnelQueryClient::new(config.tunnel_query_retry.clone())
        .query_tunnels(&endpoint, services)
        .await?;
    Ok(tunnels)
}

/// Copy into a fresh temp dir on the machine, then sync it over the project
/// directory so the directory itself is never recreated
async fn copy_files_in_place(
    session: &SshSession,
    remote_dir: &str,
    files: &[FileToCopy],
) -> Result<()> {
    let temp_dir = run_checked(
        session,
        &format!("sudo mktemp -d -p {}", shell::quote(REMOTE_DIR_BASE)),
    )
    .await?
    .stdout
    .trim()
    .to_string();
    if temp_dir.is_empty() {
        bail!("mktemp returned no directory");
    }
    run_checked(
        session,
        &format!("sudo chown \"$USER\":docker {}", shell::quote(&temp_dir)),
    )
    .await?;

    let staged: Vec<FileToCopy> = files
        .iter()
        .map(|f| FileToCopy::new(&f.local, format!("{}/{}", temp_dir, f.remote)))
        .collect();
    session.put_files(&staged).await?;

    run_checked(
        session,
        &format!(
            "rsync -ac --delete {src} {dst} && sudo rm -rf {tmp}",
            src = shell::quote(&format!("{}/", temp_dir)),
            dst = shell::quote(remote_dir),
            tmp = shell::quote(&temp_dir),
        ),
    )
    .await?;
    Ok(())
}

async fn run_checked(session: &SshSession, command: &str) -> Result<CommandOutput> {
    let output = session.exec_command(command).await?;
    check_exit(command, &output)?;
    Ok(output)
}

fn check_exit(what: &str, output: &CommandOutput) -> Result<()> {
    if !output.success() {
        bail!(
            "{} exited with {}: {}",
            what,
            output.exit_code,
            output.stderr.trim()
        );
    }
    Ok(())
}
