//! Agent state shared with the HTTP API

use pv_protocol::MachineStatusCommand;

use crate::reconciler::TunnelStateReader;

/// State read by the API handlers
#[derive(Debug, Clone)]
pub struct AgentState {
    /// Environment id the agent publishes for
    pub env_id: String,
    /// Current tunnel state
    pub tunnels: TunnelStateReader,
    /// Command behind `GET /machine-status`, if configured
    pub machine_status: Option<MachineStatusCommand>,
}

impl AgentState {
    pub fn new(
        env_id: impl Into<String>,
        tunnels: TunnelStateReader,
        machine_status: Option<MachineStatusCommand>,
    ) -> Self {
        Self {
            env_id: env_id.into(),
            tunnels,
            machine_status,
        }
    }
}
