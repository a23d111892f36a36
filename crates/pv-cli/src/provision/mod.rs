//! Getting a customized machine for an environment

mod machine;
mod scripts;

pub use machine::{MachineProvisioner, Provisioned, MACHINE_SSH_PORT};
pub use scripts::{Script, ScriptExecutor, ScriptGroups};
