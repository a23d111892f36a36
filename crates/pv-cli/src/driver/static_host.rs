//! Driver for a machine that already exists
//!
//! The host from the profile serves every environment. Nothing is ever
//! created or destroyed on the provider side.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use pv_core::config::StaticHostConfig;
use pv_core::error::DriverError;
use pv_core::traits::MachineDriver;
use pv_core::types::{Machine, SshKeyPair};

use crate::keys::generate_key_pair;

pub struct StaticHostDriver {
    config: StaticHostConfig,
}

impl StaticHostDriver {
    pub fn new(config: StaticHostConfig) -> Result<Self, DriverError> {
        if config.address.trim().is_empty() {
            return Err(DriverError::failed(
                "configure static host",
                "no address set in the profile",
            ));
        }
        Ok(Self { config })
    }

    fn machine(&self, env_id: &str, key_pair_name: &str) -> Machine {
        Machine {
            provider_id: self.config.address.clone(),
            env_id: env_id.to_string(),
            public_address: self.config.address.clone(),
            ssh_username: self.config.username.clone(),
            ssh_key_name: key_pair_name.to_string(),
            from_snapshot: false,
        }
    }
}

#[async_trait]
impl MachineDriver for StaticHostDriver {
    fn name(&self) -> &str {
        "static"
    }

    async fn get_machine(&self, env_id: &str) -> Result<Option<Machine>, DriverError> {
        Ok(Some(self.machine(env_id, &self.config.key_alias)))
    }

    async fn create_machine(
        &self,
        env_id: &str,
        key_pair_name: &str,
    ) -> Result<Machine, DriverError> {
        Ok(self.machine(env_id, key_pair_name))
    }

    async fn remove_machine(&self, provider_id: &str) -> Result<(), DriverError> {
        tracing::info!("Static host {} is not removed", provider_id);
        Ok(())
    }

    fn list_key_pairs(&self) -> BoxStream<'_, Result<String, DriverError>> {
        stream::once(async move { Ok(self.config.key_alias.clone()) }).boxed()
    }

    async fn create_key_pair(&self, _env_id: &str) -> Result<SshKeyPair, DriverError> {
        let key_pair = generate_key_pair(&self.config.key_alias)
            .map_err(|e| DriverError::failed("create key pair", e))?;
        tracing::warn!(
            "Generated key pair '{}'; authorize it for {}@{}: {}",
            key_pair.name,
            self.config.username,
            self.config.address,
            key_pair.public_key
        );
        Ok(key_pair)
    }

    async fn on_machine_created(
        &self,
        _provider_id: &str,
        _env_id: &str,
        _from_snapshot: bool,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn key_pair_alias(&self) -> String {
        self.config.key_alias.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn driver() -> StaticHostDriver {
        StaticHostDriver::new(StaticHostConfig {
            address: "203.0.113.7".to_string(),
            ..StaticHostConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_requires_address() {
        assert!(StaticHostDriver::new(StaticHostConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_machine_is_the_configured_host() {
        let driver = driver();
        let machine = driver.get_machine("demo").await.unwrap().unwrap();

        assert_eq!(machine.public_address, "203.0.113.7");
        assert_eq!(machine.ssh_username, "ubuntu");
        assert_eq!(machine.ssh_key_name, "preview");
        assert_eq!(machine.env_id, "demo");
    }

    #[tokio::test]
    async fn test_key_pairs() {
        let driver = driver();
        let names: Vec<String> = driver.list_key_pairs().try_collect().await.unwrap();
        assert_eq!(names, vec!["preview"]);

        let key_pair = driver.create_key_pair("demo").await.unwrap();
        assert_eq!(key_pair.name, driver.key_pair_alias());
    }

    #[tokio::test]
    async fn test_snapshots_unsupported() {
        let driver = driver();
        assert!(!driver.supports_post_hoc_snapshot());
        assert!(matches!(
            driver.ensure_machine_snapshot("203.0.113.7", "demo").await,
            Err(DriverError::Unsupported(_))
        ));
    }
}
