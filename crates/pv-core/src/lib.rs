//! pv-core: Core abstractions for preview environments
//!
//! Shared by the CLI and the tunnel agent: domain types, the error
//! taxonomy, configuration, the retry policy, the capability traits that
//! separate provisioning logic from providers and transports, and the
//! filesystem profile store.

pub mod config;
pub mod error;
pub mod retry;
pub mod shell;
pub mod store;
pub mod traits;
pub mod types;

pub use error::PvError;
pub use retry::RetryPolicy;
pub use types::{ContainerService, Machine, ProvisioningOutcome, SshKeyPair, TunnelRequest};
