//! Message bodies exchanged with the tunnel server and the agent API
//!
//! # Flow
//!
//! 1. The agent requests one remote forward per published service port
//! 2. The agent runs `hello` on a session channel; the server replies with a
//!    [`HelloResponse`] mapping each forward's bind address to its URL
//! 3. The agent folds that into a [`TunnelResult`] and serves it from
//!    `GET /tunnels`, which the CLI reads back after `up`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reply to the `hello` command on the tunnel server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResponse {
    /// Server-assigned client identifier
    #[serde(default)]
    pub client_id: Option<String>,
    /// Base URL of the tunnel server, if reported
    #[serde(default)]
    pub base_url: Option<String>,
    /// URL per forward bind address
    #[serde(default)]
    pub tunnels: BTreeMap<String, String>,
}

/// Published URLs for a single compose service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Compose project the service belongs to
    pub project: String,
    /// Compose service name
    pub service: String,
    /// URLs per container port
    pub ports: BTreeMap<u16, Vec<String>>,
}

/// Externally reachable URLs for the current tunnel set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResult {
    /// Client identifier assigned by the tunnel server
    #[serde(default)]
    pub client_id: Option<String>,
    /// Tunnels, ordered by service name
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

impl TunnelResult {
    /// URLs published for a (service, port) pair
    pub fn urls(&self, service: &str, port: u16) -> &[String] {
        self.tunnels
            .iter()
            .find(|t| t.service == service)
            .and_then(|t| t.ports.get(&port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Keep only the named services. An empty filter keeps everything.
    pub fn retain_services(&mut self, services: &[String]) {
        if services.is_empty() {
            return;
        }
        self.tunnels
            .retain(|t| services.iter().any(|s| s == &t.service));
    }

    /// Whether no URL is published at all
    pub fn is_empty(&self) -> bool {
        self.tunnels.iter().all(|t| t.ports.is_empty())
    }
}

/// Command the agent runs to report machine status
///
/// Passed to the agent as JSON in `MACHINE_STATUS_COMMAND`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusCommand {
    /// Program and arguments
    pub command: Vec<String>,
    /// Content type of the command's stdout
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}
