//! preview tunnel agent
//!
//! Runs inside the remote environment as part of the compose project. It
//! connects to the tunnel server, publishes every running service port of
//! the project and serves the resulting URLs over HTTP.
//!
//! Any loss of the tunnel server connection that was not asked for ends the
//! process with a non-zero status; the container restart policy brings it
//! back with a fresh session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pv_agent::docker::{DockerSource, ServiceWatcher};
use pv_agent::ssh::{
    public_key_fingerprint, HostKeyPolicy, KnownHostKeys, SessionClosed, SshOptions, SshSession,
};
use pv_agent::{api, AgentState, TunnelReconciler};
use pv_core::config::{self, AgentConfig};
use pv_core::traits::{ConnectTarget, RemoteSession};
use pv_protocol::{AccessLevel, MachineStatusCommand};

/// Username presented to the tunnel server when the URL carries none
const DEFAULT_TUNNEL_USER: &str = "preview";

#[derive(Parser)]
#[command(name = "pv-agent")]
#[command(about = "Publishes compose services through the preview tunnel server")]
#[command(version)]
struct Args {
    /// Optional TOML configuration file
    #[arg(short, long, env = "PV_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Tunnel server URL (ssh://host[:port])
    #[arg(long, env = "SSH_URL")]
    ssh_url: Option<String>,

    /// Private key material (OpenSSH)
    #[arg(long, env = "SSH_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// File holding the private key
    #[arg(long, env = "SSH_PRIVATE_KEY_FILE")]
    private_key_file: Option<PathBuf>,

    /// Directory of known tunnel server host keys
    #[arg(long, env = "KNOWN_SERVER_KEYS_DIR")]
    known_server_keys_dir: Option<PathBuf>,

    /// Accept any tunnel server host key
    #[arg(long, env = "INSECURE_SKIP_HOST_KEY")]
    insecure_skip_host_key: bool,

    /// Environment id
    #[arg(long, env = "PREVIEW_ENV_ID")]
    env_id: Option<String>,

    /// Compose project to publish
    #[arg(long, env = "COMPOSE_PROJECT")]
    compose_project: Option<String>,

    /// Access level for services without a preview.access label
    #[arg(long, env = "DEFAULT_ACCESS_LEVEL")]
    default_access: Option<AccessLevel>,

    /// Machine status command as JSON ({"command": [...], "contentType": ...})
    #[arg(long, env = "MACHINE_STATUS_COMMAND")]
    machine_status_command: Option<String>,

    /// API listen port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Debounce quantum for container events, in milliseconds
    #[arg(long, env = "DEBOUNCE_MS")]
    debounce_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = resolve_config(&args)?;
    let private_key = read_private_key(&args, &config)?;
    let host_keys = host_key_policy(&config)?;

    let ssh_url = config.ssh_url()?;
    // Validated above
    let env_id = config.env_id.clone().unwrap_or_default();
    let project = config.compose_project.clone().unwrap_or_default();

    tracing::info!(
        "Agent starting for environment '{}' (project '{}')",
        env_id,
        project
    );
    if let Some(fingerprint) = public_key_fingerprint(&private_key) {
        tracing::info!("Client public key: {}", fingerprint);
    }

    let target = ConnectTarget {
        host: ssh_url.host.clone(),
        port: ssh_url.port,
        username: ssh_url
            .username
            .clone()
            .unwrap_or_else(|| DEFAULT_TUNNEL_USER.to_string()),
        private_key,
    };
    let options = SshOptions {
        host_keys,
        env_id: env_id.clone(),
        ..SshOptions::default()
    };

    let session = Arc::new(
        SshSession::connect_with_retry(&target, &options, &config.connect_retry)
            .await
            .with_context(|| format!("Failed to connect to tunnel server {}", ssh_url))?,
    );
    let close = session.close_monitor().clone();

    let reconciler = TunnelReconciler::new(Arc::clone(&session));
    let state = Arc::new(AgentState::new(
        env_id,
        reconciler.reader(),
        config.machine_status_command.clone(),
    ));

    let source = DockerSource::connect(&project, config.default_access)
        .await
        .context("Failed to connect to Docker")?;
    let watcher = ServiceWatcher::new(source, config.debounce);

    let cancel = CancellationToken::new();

    let mut watcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            watcher
                .run(|services| reconciler.on_services_changed(services), cancel)
                .await
        })
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API on {}", addr))?;
    tracing::info!("API listening on {}", addr);

    let mut api_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
        })
    };

    let mut api_finished = false;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
        }
        closed = close.closed() => {
            if closed == SessionClosed::Unexpected {
                tracing::error!("Tunnel server connection closed unexpectedly");
            }
        }
        result = &mut watcher_task => {
            match result {
                Ok(Ok(())) => tracing::error!("Service watcher stopped"),
                Ok(Err(e)) => tracing::error!("Service watcher failed: {}", e),
                Err(e) => tracing::error!("Service watcher panicked: {}", e),
            }
        }
        result = &mut api_task => {
            api_finished = true;
            match result {
                Ok(Ok(())) => tracing::error!("API server stopped"),
                Ok(Err(e)) => tracing::error!("API server failed: {}", e),
                Err(e) => tracing::error!("API server panicked: {}", e),
            }
        }
    }

    close.request_end();
    cancel.cancel();

    let graceful = async {
        let api = async {
            if !api_finished {
                let _ = api_task.await;
            }
        };
        tokio::join!(api, session.dispose());
    };
    if tokio::time::timeout(config.shutdown_timeout, graceful).await.is_err() {
        tracing::warn!(
            "Graceful shutdown did not finish within {:?}",
            config.shutdown_timeout
        );
    }

    // The agent only ever stops because something ended it; a zero status
    // would keep the restart policy from bringing it back
    tracing::info!("Agent stopped");
    std::process::exit(1);
}

/// File configuration overlaid with command line and environment values
fn resolve_config(args: &Args) -> Result<AgentConfig> {
    let mut config: AgentConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => AgentConfig::default(),
    };

    if let Some(url) = &args.ssh_url {
        config.ssh_url = Some(url.clone());
    }
    if let Some(dir) = &args.known_server_keys_dir {
        config.known_server_keys_dir = Some(dir.clone());
    }
    if let Some(path) = &args.private_key_file {
        config.private_key_path = Some(path.clone());
    }
    if args.insecure_skip_host_key {
        config.insecure_skip_host_key = true;
    }
    if let Some(env_id) = &args.env_id {
        config.env_id = Some(env_id.clone());
    }
    if let Some(project) = &args.compose_project {
        config.compose_project = Some(project.clone());
    }
    if let Some(access) = args.default_access {
        config.default_access = access;
    }
    if let Some(raw) = &args.machine_status_command {
        let command: MachineStatusCommand =
            serde_json::from_str(raw).context("Invalid MACHINE_STATUS_COMMAND")?;
        config.machine_status_command = Some(command);
    }
    if let Some(port) = args.port {
        config.api_port = port;
    }
    if let Some(ms) = args.debounce_ms {
        config.debounce = std::time::Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

fn read_private_key(args: &Args, config: &AgentConfig) -> Result<String> {
    if let Some(key) = &args.private_key {
        return Ok(key.clone());
    }
    match &config.private_key_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key from {:?}", path)),
        None => anyhow::bail!("No private key given; set SSH_PRIVATE_KEY or SSH_PRIVATE_KEY_FILE"),
    }
}

fn host_key_policy(config: &AgentConfig) -> Result<HostKeyPolicy> {
    if config.insecure_skip_host_key {
        tracing::warn!("Tunnel server host key verification is disabled");
        return Ok(HostKeyPolicy::AcceptAny);
    }

    let dir = config
        .known_server_keys_dir
        .as_ref()
        .context("No known server keys directory; set KNOWN_SERVER_KEYS_DIR")?;
    let keys = KnownHostKeys::load_dir(dir)
        .with_context(|| format!("Failed to read known server keys from {:?}", dir))?;
    if keys.is_empty() {
        anyhow::bail!("No usable host keys in {:?}", dir);
    }
    Ok(HostKeyPolicy::Known(keys))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
