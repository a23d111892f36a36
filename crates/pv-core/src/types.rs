//! Core domain types

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use pv_protocol::tunnel::tunnel_name;
use pv_protocol::{AccessLevel, ForwardRequest};

pub use pv_protocol::{Tunnel, TunnelResult};

/// A remote compute instance hosting one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Provider-side identifier, used for removal
    pub provider_id: String,
    /// Environment this machine belongs to
    pub env_id: String,
    /// Address to SSH into
    pub public_address: String,
    /// SSH login user
    pub ssh_username: String,
    /// Name of the key pair authorized on the machine
    pub ssh_key_name: String,
    /// Whether the machine was booted from a pre-baked snapshot image
    pub from_snapshot: bool,
}

/// Named SSH key pair in OpenSSH encoding
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyPair {
    /// Key pair name as known to the driver and the key store
    pub name: String,
    /// OpenSSH private key
    pub private_key: String,
    /// OpenSSH public key line
    pub public_key: String,
}

impl fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("name", &self.name)
            .field("private_key", &"*** REDACTED ***")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// How a ready machine was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Reused a running machine whose key pair is in the store
    Existing { machine: Machine, key_pair: SshKeyPair },
    /// Created from a snapshot image; bare-machine scripts are already baked in
    FromSnapshot { machine: Machine, key_pair: SshKeyPair },
    /// Created from a bare image
    FromScratch { machine: Machine, key_pair: SshKeyPair },
}

impl ProvisioningOutcome {
    /// Outcome for a freshly created machine
    pub fn created(machine: Machine, key_pair: SshKeyPair) -> Self {
        if machine.from_snapshot {
            ProvisioningOutcome::FromSnapshot { machine, key_pair }
        } else {
            ProvisioningOutcome::FromScratch { machine, key_pair }
        }
    }

    /// The machine
    pub fn machine(&self) -> &Machine {
        match self {
            ProvisioningOutcome::Existing { machine, .. }
            | ProvisioningOutcome::FromSnapshot { machine, .. }
            | ProvisioningOutcome::FromScratch { machine, .. } => machine,
        }
    }

    /// The key pair authorized on the machine
    pub fn key_pair(&self) -> &SshKeyPair {
        match self {
            ProvisioningOutcome::Existing { key_pair, .. }
            | ProvisioningOutcome::FromSnapshot { key_pair, .. }
            | ProvisioningOutcome::FromScratch { key_pair, .. } => key_pair,
        }
    }

    /// Whether the machine was reused rather than created
    pub fn is_existing(&self) -> bool {
        matches!(self, ProvisioningOutcome::Existing { .. })
    }
}

impl fmt::Display for ProvisioningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningOutcome::Existing { .. } => write!(f, "existing"),
            ProvisioningOutcome::FromSnapshot { .. } => write!(f, "from snapshot"),
            ProvisioningOutcome::FromScratch { .. } => write!(f, "from scratch"),
        }
    }
}

/// A running compose service with published ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerService {
    /// Compose service name
    pub name: String,
    /// Compose project
    pub project: String,
    /// Exposed TCP ports
    pub ports: Vec<u16>,
    /// Requested access level
    pub access: AccessLevel,
    /// Host the agent dials to reach the service
    pub host: String,
}

/// One (service, port) pair to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub service: String,
    pub project: String,
    pub port: u16,
    pub access: AccessLevel,
    pub host: String,
}

impl TunnelTarget {
    /// Remote forward requested for this target
    pub fn forward_request(&self, env_id: &str) -> ForwardRequest {
        ForwardRequest::new(tunnel_name(&self.service, self.port, env_id), self.access)
    }

    /// `host:port` the agent connects to for inbound tunnel traffic
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The complete desired tunnel set, ordered by (service, port)
///
/// Always sent wholesale; the first service listed wins when two entries
/// name the same (service, port).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelRequest {
    targets: Vec<TunnelTarget>,
}

impl TunnelRequest {
    /// Build from the current service list
    pub fn from_services(services: &[ContainerService]) -> Self {
        let mut by_key: BTreeMap<(String, u16), TunnelTarget> = BTreeMap::new();
        for service in services {
            for &port in &service.ports {
                by_key
                    .entry((service.name.clone(), port))
                    .or_insert_with(|| TunnelTarget {
                        service: service.name.clone(),
                        project: service.project.clone(),
                        port,
                        access: service.access,
                        host: service.host.clone(),
                    });
            }
        }
        Self {
            targets: by_key.into_values().collect(),
        }
    }

    /// Targets in (service, port) order
    pub fn targets(&self) -> &[TunnelTarget] {
        &self.targets
    }

    /// Targets keyed by the bind address of their remote forward.
    ///
    /// Distinct services can sanitize to the same tunnel name (`web_1` and
    /// `web-1`). Every target after the first one with a taken name gets a
    /// suffix derived from its raw service name, so no target is dropped.
    pub fn forwards(&self, env_id: &str) -> BTreeMap<String, TunnelTarget> {
        let mut forwards = BTreeMap::new();
        for target in &self.targets {
            let mut request = target.forward_request(env_id);
            if forwards.contains_key(&request.bind_address()) {
                let digest = Sha256::digest(target.service.as_bytes());
                let unique = format!("{}-{}", request.name, hex::encode(&digest[..3]));
                tracing::warn!(
                    "Tunnel name {} of service '{}' is taken; using {}",
                    request.name,
                    target.service,
                    unique
                );
                request.name = unique;
            }
            forwards.insert(request.bind_address(), target.clone());
        }
        forwards
    }

    /// Number of (service, port) pairs
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl CommandOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A local file and where it goes on the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileToCopy {
    pub local: PathBuf,
    pub remote: String,
}

impl FileToCopy {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}
