//! SSH session traits

use async_trait::async_trait;

use crate::error::{ConnectError, SessionError};
use crate::types::{CommandOutput, ContainerService, FileToCopy, TunnelResult};

/// Operations on an established SSH session to a machine
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command and collect its output.
    ///
    /// A non-zero exit status is not an error at this level.
    async fn exec_command(&self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Copy local files to the machine
    async fn put_files(&self, files: &[FileToCopy]) -> Result<(), SessionError>;

    /// Close the transport. Calling this more than once is a no-op.
    async fn dispose(&self);
}

/// A session that can publish tunnels through the tunnel server
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Replace the whole published tunnel set with one derived from
    /// `services` and return the URLs for it.
    ///
    /// `generation` is the caller's request order. Calls may reach the
    /// session in any order; one whose generation is not newer than the
    /// last one applied changes nothing and fails with
    /// [`SessionError::Superseded`]. The set left on the server is always
    /// that of the newest generation seen.
    async fn update_tunnels(
        &self,
        generation: u64,
        services: &[ContainerService],
    ) -> Result<TunnelResult, SessionError>;
}

/// Where and as whom to connect
#[derive(Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// OpenSSH private key
    pub private_key: String,
}

impl ConnectTarget {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Opens sessions; one attempt per call, retries belong to the caller
#[async_trait]
pub trait SessionConnector: Send + Sync {
    type Session: RemoteSession + 'static;

    async fn connect(&self, target: &ConnectTarget) -> Result<Self::Session, ConnectError>;
}
