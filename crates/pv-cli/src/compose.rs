//! Compose project handling
//!
//! The user's compose files are copied verbatim. The tunnel agent is added
//! through a generated override file, and every compose command runs on
//! the machine inside the remote project directory.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::json;

use pv_agent::docker::AGENT_LABEL;
use pv_core::shell;
use pv_protocol::{AccessLevel, AGENT_API_PORT};

/// Compose service name of the tunnel agent
pub const AGENT_SERVICE: &str = "preview_agent";

/// Remote base directory for environment files
pub const REMOTE_DIR_BASE: &str = "/var/lib/preview";

/// Name of the generated override file
pub const OVERRIDE_FILE: &str = "preview.override.json";

/// Staged agent files, relative to the project directory
pub const AGENT_KEY_FILE: &str = ".preview/tunnel_client_private_key";
pub const AGENT_KNOWN_KEYS_DIR: &str = ".preview/known_server_keys";

const DEFAULT_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// A local compose project
#[derive(Debug, Clone)]
pub struct ComposeProject {
    pub name: String,
    pub files: Vec<PathBuf>,
}

impl ComposeProject {
    /// Remote directory holding this project's files
    pub fn remote_dir(&self) -> String {
        format!("{}/projects/{}", REMOTE_DIR_BASE, self.name)
    }

    /// File names the compose files get in the remote directory.
    ///
    /// Names are the local base names, prefixed with their position so two
    /// files from different directories cannot collide.
    pub fn remote_file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let base = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "compose.yaml".to_string());
                if i == 0 {
                    base
                } else {
                    format!("{}-{}", i, base)
                }
            })
            .collect()
    }
}

/// Compose files given on the command line, or the first default file
/// found in `dir`
pub fn find_compose_files(given: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    if !given.is_empty() {
        for file in given {
            if !file.is_file() {
                bail!("Compose file {:?} not found", file);
            }
        }
        return Ok(given.to_vec());
    }

    DEFAULT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .map(|path| vec![path])
        .with_context(|| format!("No compose file found in {:?}", dir))
}

/// Resolve the project name: the override, else the `name` of the
/// normalized local model
pub async fn resolve_project(
    files: Vec<PathBuf>,
    name_override: Option<&str>,
) -> Result<ComposeProject> {
    if let Some(name) = name_override {
        return Ok(ComposeProject {
            name: name.to_string(),
            files,
        });
    }

    let mut command = tokio::process::Command::new("docker");
    command.arg("compose");
    for file in &files {
        command.arg("-f").arg(file);
    }
    command.args(["config", "--format", "json"]);

    let output = command
        .output()
        .await
        .context("Failed to run docker compose")?;
    if !output.status.success() {
        bail!(
            "docker compose config failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let name = model_name(&output.stdout)?;
    Ok(ComposeProject { name, files })
}

fn model_name(model: &[u8]) -> Result<String> {
    let model: serde_json::Value =
        serde_json::from_slice(model).context("Invalid docker compose config output")?;
    model
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .context("Compose model has no project name")
}

/// Settings of the agent service
#[derive(Debug, Clone)]
pub struct AgentService {
    pub image: String,
    pub env_id: String,
    pub project: String,
    pub tunnel_url: String,
    pub default_access: AccessLevel,
    pub insecure_skip_host_key: bool,
}

impl AgentService {
    /// Compose override adding the agent to the project
    pub fn override_model(&self) -> serde_json::Value {
        let mut environment = json!({
            "SSH_URL": self.tunnel_url,
            "SSH_PRIVATE_KEY_FILE": "/preview/tunnel_client_private_key",
            "KNOWN_SERVER_KEYS_DIR": "/preview/known_server_keys",
            "PREVIEW_ENV_ID": self.env_id,
            "COMPOSE_PROJECT": self.project,
            "DEFAULT_ACCESS_LEVEL": self.default_access.to_string(),
            "PORT": AGENT_API_PORT.to_string(),
        });
        if self.insecure_skip_host_key {
            environment["INSECURE_SKIP_HOST_KEY"] = json!("true");
        }

        json!({
            "services": {
                AGENT_SERVICE: {
                    "image": self.image,
                    "restart": "always",
                    "labels": { AGENT_LABEL: "true" },
                    "environment": environment,
                    "volumes": [
                        "/var/run/docker.sock:/var/run/docker.sock",
                        format!("./{}:/preview/tunnel_client_private_key:ro", AGENT_KEY_FILE),
                        format!("./{}:/preview/known_server_keys:ro", AGENT_KNOWN_KEYS_DIR),
                    ],
                    "ports": [{
                        "target": AGENT_API_PORT,
                        "host_ip": "127.0.0.1",
                        "protocol": "tcp",
                    }],
                }
            }
        })
    }
}

/// `docker compose` invocation run on the machine
pub struct RemoteCompose<'a> {
    project: &'a ComposeProject,
}

impl<'a> RemoteCompose<'a> {
    pub fn new(project: &'a ComposeProject) -> Self {
        Self { project }
    }

    /// Command line running compose with `args` in the project directory
    pub fn command<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut words: Vec<String> = vec![
            "sudo".into(),
            "docker".into(),
            "compose".into(),
            "-p".into(),
            self.project.name.clone(),
        ];
        for file in self
            .project
            .remote_file_names()
            .into_iter()
            .chain([OVERRIDE_FILE.to_string()])
        {
            words.push("-f".into());
            words.push(file);
        }
        words.extend(args.into_iter().map(|a| a.as_ref().to_string()));

        format!(
            "cd {} && {}",
            shell::quote(&self.project.remote_dir()),
            shell::join(&words)
        )
    }

    /// `up` for the given services (all when empty) plus the agent
    pub fn up(&self, services: &[String]) -> String {
        let mut args: Vec<String> = ["up", "-d", "--remove-orphans", "--build"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if !services.is_empty() {
            args.extend(services.iter().cloned());
            args.push(AGENT_SERVICE.to_string());
        }
        self.command(args)
    }

    /// `port` lookup of the agent API
    pub fn agent_port(&self) -> String {
        self.command(["port", AGENT_SERVICE, &AGENT_API_PORT.to_string()])
    }
}

/// Parse `docker compose port` output (`127.0.0.1:49153`)
pub fn parse_published_port(output: &str) -> Option<(String, u16)> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (host, port) = line.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = match host.trim_matches(|c| c == '[' || c == ']') {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    Some((host.to_string(), port))
}
