//! SSH transport
//!
//! [`SshSession`] serves both ends of the system: the CLI uses it to run
//! commands on a machine and to reach the agent API through a local
//! forward; the agent uses it to hold remote forwards on the tunnel server.

mod client;
mod close;
pub(crate) mod forwards;
mod handler;
mod known_hosts;
mod relay;

pub use client::{public_key_fingerprint, LocalForward, SshConnector, SshOptions, SshSession};
pub use close::{CloseGuard, CloseMonitor, SessionClosed};
pub use known_hosts::{HostKeyPolicy, KnownHostKeys};
