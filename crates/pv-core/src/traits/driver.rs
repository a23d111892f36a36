//! Machine driver trait

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::DriverError;
use crate::types::{Machine, SshKeyPair};

/// Provider capability for creating, finding and removing machines
///
/// One implementation exists per compute provider. The provisioner only
/// talks to providers through this trait.
#[async_trait]
pub trait MachineDriver: Send + Sync {
    /// Short driver name, shown to users and stored in the profile
    fn name(&self) -> &str;

    /// Machine currently serving `env_id`, if any
    async fn get_machine(&self, env_id: &str) -> Result<Option<Machine>, DriverError>;

    /// Create a machine for `env_id` authorized for the named key pair
    async fn create_machine(
        &self,
        env_id: &str,
        key_pair_name: &str,
    ) -> Result<Machine, DriverError>;

    /// Destroy a machine
    async fn remove_machine(&self, provider_id: &str) -> Result<(), DriverError>;

    /// Key pair names known to the provider, in provider order.
    ///
    /// The stream is lazy; consumers stop polling once they find a usable
    /// entry.
    fn list_key_pairs(&self) -> BoxStream<'_, Result<String, DriverError>>;

    /// Create and register a new key pair
    async fn create_key_pair(&self, env_id: &str) -> Result<SshKeyPair, DriverError>;

    /// Driver bookkeeping once a new machine is customized
    async fn on_machine_created(
        &self,
        provider_id: &str,
        env_id: &str,
        from_snapshot: bool,
    ) -> Result<(), DriverError>;

    /// Capture a snapshot image of the machine
    async fn ensure_machine_snapshot(
        &self,
        _provider_id: &str,
        _env_id: &str,
    ) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("machine snapshots"))
    }

    /// Whether new machines are finalized through
    /// [`ensure_machine_snapshot`](Self::ensure_machine_snapshot) in the
    /// background instead of [`on_machine_created`](Self::on_machine_created)
    fn supports_post_hoc_snapshot(&self) -> bool {
        false
    }

    /// Name under which this driver's key pair is stored
    fn key_pair_alias(&self) -> String;
}
