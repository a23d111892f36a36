//! pv-protocol: Wire types shared by the preview CLI and the tunnel agent
//!
//! Everything that crosses a process boundary lives here: how a
//! (service, port) pair is named when it is requested as a remote forward,
//! the tunnel server's `hello` reply, the agent API bodies and the SSH URL
//! format used to reach the tunnel server.

pub mod error;
pub mod message;
pub mod ssh_url;
pub mod tunnel;

pub use error::ProtocolError;
pub use message::{HelloResponse, MachineStatusCommand, Tunnel, TunnelResult};
pub use ssh_url::SshUrl;
pub use tunnel::{AccessLevel, ForwardRequest};

/// Port the agent API listens on inside the remote environment.
pub const AGENT_API_PORT: u16 = 3000;
