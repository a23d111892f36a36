//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use pv_protocol::{AccessLevel, MachineStatusCommand, SshUrl, AGENT_API_PORT};

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Configuration for the tunnel agent running next to the compose project
///
/// Every field can also be supplied on the command line or through the
/// environment; those take precedence over the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tunnel server URL, `ssh://host[:port]`
    pub ssh_url: Option<String>,

    /// File holding the agent's OpenSSH private key
    pub private_key_path: Option<PathBuf>,

    /// Directory of known tunnel server host keys, one file per host
    pub known_server_keys_dir: Option<PathBuf>,

    /// Accept any tunnel server host key
    pub insecure_skip_host_key: bool,

    /// Environment id used in tunnel names
    pub env_id: Option<String>,

    /// Compose project whose containers are published
    pub compose_project: Option<String>,

    /// Access level for services without a `preview.access` label
    pub default_access: AccessLevel,

    /// Command run by `GET /machine-status`
    pub machine_status_command: Option<MachineStatusCommand>,

    /// Port the HTTP API listens on
    pub api_port: u16,

    /// Quiet period before a burst of container events is acted on
    #[serde(with = "duration_millis")]
    pub debounce: Duration,

    /// Bound on graceful shutdown before the process exits anyway
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Retry policy for reaching the tunnel server
    pub connect_retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ssh_url: None,
            private_key_path: None,
            known_server_keys_dir: None,
            insecure_skip_host_key: false,
            env_id: None,
            compose_project: None,
            default_access: AccessLevel::Public,
            machine_status_command: None,
            api_port: AGENT_API_PORT,
            debounce: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            connect_retry: RetryPolicy::agent_connect(),
        }
    }
}

impl AgentConfig {
    /// Parsed tunnel server URL
    pub fn ssh_url(&self) -> Result<SshUrl, ConfigError> {
        let raw = self
            .ssh_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("ssh_url".to_string()))?;
        raw.parse()
            .map_err(|e| ConfigError::Invalid(format!("ssh_url: {}", e)))
    }

    /// Check that everything the agent cannot start without is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ssh_url()?;
        if self.env_id.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingField("env_id".to_string()));
        }
        if self.compose_project.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingField("compose_project".to_string()));
        }
        if self.debounce.is_zero() {
            return Err(ConfigError::Invalid("debounce must be positive".to_string()));
        }
        Ok(())
    }
}
