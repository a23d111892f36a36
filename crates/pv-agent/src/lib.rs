//! pv-agent: Tunnel agent for preview environments
//!
//! Runs next to a compose project on the remote machine. It holds one SSH
//! session to the tunnel server, watches the project's containers and keeps
//! one remote forward per published service port. The current URLs are
//! served over a small HTTP API that the CLI reads back after `up`.
//!
//! The SSH layer is also used by the CLI to reach machines.

pub mod api;
pub mod docker;
pub mod reconciler;
pub mod ssh;
pub mod state;

pub use reconciler::{TunnelReconciler, TunnelState, TunnelStateReader};
pub use state::AgentState;
