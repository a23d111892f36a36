//! Machine provisioning
//!
//! Finds or creates the machine for an environment, connects to it and
//! runs the customization scripts the outcome calls for. A machine created
//! by a failed run is removed again before the error is returned.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;

use pv_core::error::{ProvisionError, ProvisionPhase};
use pv_core::traits::{ConnectTarget, KeyStore, MachineDriver, RemoteSession, SessionConnector};
use pv_core::types::{Machine, ProvisioningOutcome, SshKeyPair};
use pv_core::RetryPolicy;

use super::scripts::{ScriptExecutor, ScriptGroups};

/// SSH port of provisioned machines
pub const MACHINE_SSH_PORT: u16 = 22;

/// A customized machine with an open session
pub struct Provisioned<S> {
    pub outcome: ProvisioningOutcome,
    pub session: S,
    /// Background snapshot of a new machine, when the driver takes them
    /// after the fact. Its failure is only logged.
    pub snapshot: Option<JoinHandle<()>>,
}

impl<S> Provisioned<S> {
    pub fn machine(&self) -> &Machine {
        self.outcome.machine()
    }
}

pub struct MachineProvisioner<D, K, C> {
    driver: Arc<D>,
    keys: Arc<K>,
    connector: C,
    ssh_retry: RetryPolicy,
    scripts: ScriptGroups,
}

impl<D, K, C> MachineProvisioner<D, K, C>
where
    D: MachineDriver + 'static,
    K: KeyStore,
    C: SessionConnector,
{
    pub fn new(driver: Arc<D>, keys: Arc<K>, connector: C) -> Self {
        Self {
            driver,
            keys,
            connector,
            ssh_retry: RetryPolicy::ssh_connect(),
            scripts: ScriptGroups::builtin(),
        }
    }

    pub fn with_ssh_retry(mut self, policy: RetryPolicy) -> Self {
        self.ssh_retry = policy;
        self
    }

    pub fn with_scripts(mut self, scripts: ScriptGroups) -> Self {
        self.scripts = scripts;
        self
    }

    /// Provision the machine for `env_id` and return it with a live session
    pub async fn provision(&self, env_id: &str) -> Result<Provisioned<C::Session>, ProvisionError> {
        let outcome = self.ensure_machine(env_id).await?;
        tracing::info!(
            "Machine {} ready ({})",
            outcome.machine().provider_id,
            outcome
        );

        let session = match self.connect(&outcome).await {
            Ok(session) => session,
            Err(e) => {
                self.rollback(&outcome, None).await;
                return Err(e);
            }
        };

        match self.customize(env_id, &outcome, &session).await {
            Ok(snapshot) => Ok(Provisioned {
                outcome,
                session,
                snapshot,
            }),
            Err(e) => {
                self.rollback(&outcome, Some(&session)).await;
                Err(e)
            }
        }
    }

    /// Reuse the environment's machine if its key is still stored, else
    /// create a new one.
    async fn ensure_machine(&self, env_id: &str) -> Result<ProvisioningOutcome, ProvisionError> {
        let existing = self
            .driver
            .get_machine(env_id)
            .await
            .map_err(ProvisionError::driver(ProvisionPhase::MachineCreation))?;

        let stale = match existing {
            Some(machine) => match self.keys.read(&machine.ssh_key_name).await? {
                Some(key_pair) => {
                    return Ok(ProvisioningOutcome::Existing { machine, key_pair });
                }
                None => {
                    tracing::warn!(
                        "No stored key pair '{}' for machine {}, recreating it",
                        machine.ssh_key_name,
                        machine.provider_id
                    );
                    Some(machine)
                }
            },
            None => None,
        };

        // The stale machine goes away while the new one is created; both
        // finish before provisioning continues.
        let removal = async {
            if let Some(machine) = &stale {
                if let Err(e) = self.driver.remove_machine(&machine.provider_id).await {
                    tracing::warn!(
                        "Failed to remove stale machine {}: {}",
                        machine.provider_id,
                        e
                    );
                }
            }
        };
        let ((), created) = tokio::join!(removal, self.create_machine(env_id));
        created
    }

    async fn create_machine(&self, env_id: &str) -> Result<ProvisioningOutcome, ProvisionError> {
        let key_pair = self.resolve_key_pair(env_id).await?;

        tracing::info!("Creating machine for environment '{}'", env_id);
        let machine = self
            .driver
            .create_machine(env_id, &key_pair.name)
            .await
            .map_err(ProvisionError::driver(ProvisionPhase::MachineCreation))?;

        Ok(ProvisioningOutcome::created(machine, key_pair))
    }

    /// First driver key pair with a stored private half, else a new one
    async fn resolve_key_pair(&self, env_id: &str) -> Result<SshKeyPair, ProvisionError> {
        {
            let mut names = self.driver.list_key_pairs();
            while let Some(name) = names.next().await {
                let name = name.map_err(ProvisionError::driver(ProvisionPhase::KeyResolution))?;
                if let Some(key_pair) = self.keys.read(&name).await? {
                    tracing::debug!("Using stored key pair '{}'", name);
                    return Ok(key_pair);
                }
            }
        }

        tracing::info!("Creating key pair");
        let key_pair = self
            .driver
            .create_key_pair(env_id)
            .await
            .map_err(ProvisionError::driver(ProvisionPhase::KeyResolution))?;
        self.keys.write(&key_pair.name, &key_pair).await?;
        Ok(key_pair)
    }

    async fn connect(&self, outcome: &ProvisioningOutcome) -> Result<C::Session, ProvisionError> {
        let machine = outcome.machine();
        let target = ConnectTarget {
            host: machine.public_address.clone(),
            port: MACHINE_SSH_PORT,
            username: machine.ssh_username.clone(),
            private_key: outcome.key_pair().private_key.clone(),
        };

        self.ssh_retry
            .retry_if(
                &format!("SSH connect to {}", target.address()),
                || self.connector.connect(&target),
                |e| e.is_retryable(),
            )
            .await
            .map_err(|e| ProvisionError::Connect(e.into_inner()))
    }

    async fn customize(
        &self,
        env_id: &str,
        outcome: &ProvisioningOutcome,
        session: &C::Session,
    ) -> Result<Option<JoinHandle<()>>, ProvisionError> {
        let executor = ScriptExecutor::new(session);
        let machine = outcome.machine();

        if let ProvisioningOutcome::FromScratch { .. } = outcome {
            tracing::debug!("Running bare machine scripts");
            executor.run_all(&self.scripts.bare_machine).await?;
        }

        let mut snapshot = None;
        if !outcome.is_existing() {
            if self.driver.supports_post_hoc_snapshot() {
                snapshot = Some(self.spawn_snapshot(machine, env_id));
            } else {
                tracing::info!("Finishing machine creation");
                self.driver
                    .on_machine_created(&machine.provider_id, env_id, machine.from_snapshot)
                    .await
                    .map_err(ProvisionError::driver(ProvisionPhase::Finalize))?;
            }
        }

        tracing::debug!("Running instance scripts");
        executor.run_all(&self.scripts.instance_specific).await?;

        Ok(snapshot)
    }

    fn spawn_snapshot(&self, machine: &Machine, env_id: &str) -> JoinHandle<()> {
        let driver = Arc::clone(&self.driver);
        let provider_id = machine.provider_id.clone();
        let env_id = env_id.to_string();
        tokio::spawn(async move {
            match driver.ensure_machine_snapshot(&provider_id, &env_id).await {
                Ok(()) => tracing::info!("Snapshot of machine {} ready", provider_id),
                Err(e) => tracing::warn!("Snapshot of machine {} failed: {}", provider_id, e),
            }
        })
    }

    /// Remove a machine this run created and close the session
    async fn rollback(&self, outcome: &ProvisioningOutcome, session: Option<&C::Session>) {
        if !outcome.is_existing() {
            let provider_id = &outcome.machine().provider_id;
            tracing::debug!("Removing new machine {} after failure", provider_id);
            if let Err(e) = self.driver.remove_machine(provider_id).await {
                tracing::warn!("Failed to remove machine {}: {}", provider_id, e);
            }
        }
        if let Some(session) = session {
            session.dispose().await;
        }
    }
}
