//! Remote forward bookkeeping
//!
//! [`AppliedForwards`] is the set of forwards the tunnel server currently
//! holds for us. Updating it is a diff against the desired set: forwards
//! no longer wanted are cancelled, new ones are requested, and ones present
//! in both are kept with their upstream refreshed. The forward table read
//! by the client handler always holds exactly the applied bind addresses.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use pv_core::error::SessionError;
use pv_core::types::TunnelTarget;

/// Upstream `host:port` per remote forward bind address
pub(crate) type ForwardTable = Arc<DashMap<String, String>>;

/// Requests and cancels remote forwards on the server
#[async_trait]
pub(crate) trait Forwarder: Send + Sync {
    async fn request(&self, bind: &str) -> Result<(), String>;
    async fn cancel(&self, bind: &str) -> Result<(), String>;
}

/// Bind addresses to cancel and to request, in bind address order
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ForwardPlan {
    pub cancel: Vec<String>,
    pub add: Vec<String>,
}

/// Diff the applied forwards against the desired ones
pub(crate) fn plan(
    applied: &BTreeMap<String, TunnelTarget>,
    desired: &BTreeMap<String, TunnelTarget>,
) -> ForwardPlan {
    ForwardPlan {
        cancel: applied
            .keys()
            .filter(|bind| !desired.contains_key(*bind))
            .cloned()
            .collect(),
        add: desired
            .keys()
            .filter(|bind| !applied.contains_key(*bind))
            .cloned()
            .collect(),
    }
}

/// Forwards held on the server and the newest update generation applied
#[derive(Debug, Default)]
pub(crate) struct AppliedForwards {
    generation: u64,
    targets: BTreeMap<String, TunnelTarget>,
}

impl AppliedForwards {
    /// Take `generation` as the newest update, refusing older ones
    pub fn claim(&mut self, generation: u64) -> Result<(), SessionError> {
        if generation <= self.generation {
            return Err(SessionError::Superseded {
                generation,
                latest: self.generation,
            });
        }
        self.generation = generation;
        Ok(())
    }

    pub fn targets(&self) -> &BTreeMap<String, TunnelTarget> {
        &self.targets
    }

    /// Bring the server in line with `desired`.
    ///
    /// Stops at the first rejected request. What was applied up to that
    /// point stays applied and recorded, so the next update diffs against
    /// what the server really holds.
    pub async fn apply<F: Forwarder + ?Sized>(
        &mut self,
        desired: &BTreeMap<String, TunnelTarget>,
        forwarder: &F,
        table: &ForwardTable,
    ) -> Result<(), SessionError> {
        let plan = plan(&self.targets, desired);

        for bind in &plan.cancel {
            table.remove(bind);
            self.targets.remove(bind);
            match forwarder.cancel(bind).await {
                Ok(()) => tracing::info!("Removed tunnel {}", bind),
                Err(e) => tracing::warn!("Failed to cancel forward {}: {}", bind, e),
            }
        }

        for (bind, target) in desired {
            table.insert(bind.clone(), target.upstream());
            if self.targets.contains_key(bind) {
                self.targets.insert(bind.clone(), target.clone());
                continue;
            }

            if let Err(reason) = forwarder.request(bind).await {
                table.remove(bind);
                return Err(SessionError::Forward {
                    name: bind.clone(),
                    reason,
                });
            }
            tracing::info!("Added tunnel {} -> {}", bind, target.upstream());
            self.targets.insert(bind.clone(), target.clone());
        }

        Ok(())
    }
}
