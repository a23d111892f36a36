//! Container engine access and the debounced service watcher

mod engine;
mod watcher;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use pv_core::types::ContainerService;

pub use engine::{DockerSource, ACCESS_LABEL, AGENT_LABEL, PROJECT_LABEL, SERVICE_LABEL};
pub use watcher::{ServiceWatcher, DEFAULT_DEBOUNCE};

/// Container engine errors
#[derive(Debug, Error)]
pub enum WatchError {
    /// Engine API call failed
    #[error("Container engine error: {0}")]
    Engine(String),

    /// The event subscription ended
    #[error("Container event stream ended")]
    EventsEnded,
}

/// Source of running services and of lifecycle events for one project
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Services of the project that are running and expose TCP ports
    async fn list_services(&self) -> Result<Vec<ContainerService>, WatchError>;

    /// One item per qualifying raw lifecycle event
    fn events(&self) -> BoxStream<'_, Result<(), WatchError>>;
}
