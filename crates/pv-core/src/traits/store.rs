//! Key store trait

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::SshKeyPair;

/// Persistent storage for named SSH key pairs
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Read a key pair; `None` when nothing is stored under `name`
    async fn read(&self, name: &str) -> Result<Option<SshKeyPair>, StoreError>;

    /// Store a key pair, replacing any previous entry
    async fn write(&self, name: &str, key_pair: &SshKeyPair) -> Result<(), StoreError>;
}
