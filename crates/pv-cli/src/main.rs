//! preview CLI

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pv_core::config;
use pv_core::store::{FsProfileStore, ProfileRegistry};
use preview::commands::{self, InitOptions, UpOptions};
use preview::output::print_error;

#[derive(Parser)]
#[command(name = "preview")]
#[command(author, version, about = "Preview environments for compose projects")]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the profiles
    #[arg(long, global = true, env = "PREVIEW_PROFILES_DIR")]
    profiles_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up a preview environment for the compose project
    Up {
        /// Compose files (default: compose.yaml or docker-compose.yml)
        #[arg(short = 'f', long = "file")]
        files: Vec<PathBuf>,

        /// Project name (default: from the compose model)
        #[arg(short, long)]
        project: Option<String>,

        /// Environment id (default: the project name)
        #[arg(long)]
        id: Option<String>,

        /// Services to start (default: all)
        services: Vec<String>,
    },

    /// SSH into an environment's machine
    Ssh {
        /// Environment id
        env_id: String,

        /// Arguments passed on to ssh
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Manage profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show the current profile
    Current,

    /// Import a profile directory and make it current
    Import {
        /// Profile directory to import
        location: PathBuf,

        /// Name for the imported profile
        #[arg(long)]
        name: Option<String>,
    },

    /// Create a profile for an existing host and make it current
    Init {
        /// Host name or address of the machine
        address: String,

        /// Profile name
        #[arg(long, default_value = "default")]
        name: String,

        /// SSH login user on the host
        #[arg(long)]
        username: Option<String>,

        /// Tunnel server URL (ssh://host[:port])
        #[arg(long)]
        tunnel_url: Option<String>,

        /// Private key authorized on the host
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let registry = ProfileRegistry::new(
        cli.profiles_dir
            .clone()
            .unwrap_or_else(config::default_profiles_dir),
    );

    match cli.command {
        Commands::Up {
            files,
            project,
            id,
            services,
        } => {
            let store = current_store(&registry)?;
            let options = UpOptions {
                compose_files: files,
                project,
                env_id: id,
                services,
            };
            if let Err(e) = commands::up_command(&store, options).await {
                print_error(&format!("{:#}", e));
                std::process::exit(1);
            }
        }

        Commands::Ssh { env_id, args } => {
            let store = current_store(&registry)?;
            let code = commands::ssh_command(&store, &env_id, &args).await?;
            std::process::exit(code);
        }

        Commands::Profile { action } => match action {
            ProfileAction::Current => commands::profile_current(&registry)?,
            ProfileAction::Import { location, name } => {
                commands::profile_import(&registry, &location, name.as_deref())?
            }
            ProfileAction::Init {
                address,
                name,
                username,
                tunnel_url,
                key_file,
            } => {
                commands::profile_init(
                    &registry,
                    InitOptions {
                        alias: name,
                        address,
                        username,
                        tunnel_url,
                        key_file,
                    },
                )
                .await?
            }
        },
    }

    Ok(())
}

fn current_store(registry: &ProfileRegistry) -> Result<FsProfileStore> {
    registry
        .current_store()?
        .context("No current profile; create one with `preview profile init <address>`")
}
