//! Per-profile CLI configuration

use serde::{Deserialize, Serialize};

use pv_protocol::{AccessLevel, SshUrl};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Settings of one profile, stored as `profile.toml` in the profile directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Pre-provisioned host used by the static-host driver
    pub static_host: StaticHostConfig,

    /// Image of the tunnel agent added to every compose project
    pub agent_image: String,

    /// Tunnel server URL handed to the agent
    pub tunnel_url: String,

    /// Access level for services that do not ask for one
    pub default_access: AccessLevel,

    /// Retry policy for the first SSH connection to a machine
    pub ssh_retry: RetryPolicy,

    /// Retry policy for polling the agent for tunnel URLs
    pub tunnel_query_retry: RetryPolicy,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            static_host: StaticHostConfig::default(),
            agent_image: "ghcr.io/preview-dev/pv-agent:latest".to_string(),
            tunnel_url: "ssh://localhost:2222".to_string(),
            default_access: AccessLevel::Public,
            ssh_retry: RetryPolicy::ssh_connect(),
            tunnel_query_retry: RetryPolicy::tunnel_query(),
        }
    }
}

impl ProfileConfig {
    /// Parsed tunnel server URL
    pub fn tunnel_url(&self) -> Result<SshUrl, ConfigError> {
        self.tunnel_url
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("tunnel_url: {}", e)))
    }
}

/// A machine that already exists and is reached directly over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticHostConfig {
    /// Host name or address
    pub address: String,

    /// SSH login user
    pub username: String,

    /// Name of the key pair authorized on the host
    pub key_alias: String,
}

impl Default for StaticHostConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: "ubuntu".to_string(),
            key_alias: "preview".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_minimal_profile() {
        let config: ProfileConfig = toml::from_str(
            r#"
            tunnel_url = "ssh://tunnels.example.com:2222"

            [static_host]
            address = "203.0.113.7"

            [ssh_retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.static_host.address, "203.0.113.7");
        assert_eq!(config.static_host.username, "ubuntu");
        assert_eq!(config.ssh_retry.max_attempts, 3);
        assert_eq!(config.ssh_retry.min_delay, Duration::from_secs(1));
        assert_eq!(config.tunnel_url().unwrap().port, 2222);
    }

    #[test]
    fn test_invalid_tunnel_url() {
        let config = ProfileConfig {
            tunnel_url: "tunnels.example.com".to_string(),
            ..ProfileConfig::default()
        };
        assert!(config.tunnel_url().is_err());
    }
}
