//! Capability traits at the seams between provisioning, storage and SSH

mod driver;
mod session;
mod store;

pub use driver::MachineDriver;
pub use session::{ConnectTarget, RemoteSession, SessionConnector, TunnelSession};
pub use store::KeyStore;
