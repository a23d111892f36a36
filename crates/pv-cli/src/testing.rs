//! In-memory drivers, stores and sessions for provisioning tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use pv_core::error::{ConnectError, DriverError, SessionError, StoreError};
use pv_core::traits::{ConnectTarget, KeyStore, MachineDriver, RemoteSession, SessionConnector};
use pv_core::types::{CommandOutput, FileToCopy, Machine, SshKeyPair};

pub fn machine(env_id: &str, provider_id: &str, key_name: &str) -> Machine {
    Machine {
        provider_id: provider_id.to_string(),
        env_id: env_id.to_string(),
        public_address: "198.51.100.10".to_string(),
        ssh_username: "ubuntu".to_string(),
        ssh_key_name: key_name.to_string(),
        from_snapshot: false,
    }
}

pub fn key_pair(name: &str) -> SshKeyPair {
    SshKeyPair {
        name: name.to_string(),
        private_key: format!("private-{}", name),
        public_key: format!("ssh-ed25519 AAAA {}", name),
    }
}

/// Calls observed by [`FakeDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    GetMachine(String),
    CreateMachine { env_id: String, key_pair: String },
    RemoveMachine(String),
    ListKeyPairs,
    CreateKeyPair(String),
    OnMachineCreated { provider_id: String, from_snapshot: bool },
    EnsureSnapshot(String),
}

#[derive(Default)]
pub struct FakeDriver {
    pub existing: Mutex<Option<Machine>>,
    pub key_pairs: Vec<String>,
    pub boot_from_snapshot: bool,
    pub post_hoc_snapshot: bool,
    pub fail_create: bool,
    pub calls: Mutex<Vec<DriverCall>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing(self, machine: Machine) -> Self {
        *self.existing.lock().unwrap() = Some(machine);
        self
    }

    pub fn with_key_pairs(mut self, names: &[&str]) -> Self {
        self.key_pairs = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, f: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls().iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MachineDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn get_machine(&self, env_id: &str) -> Result<Option<Machine>, DriverError> {
        self.record(DriverCall::GetMachine(env_id.to_string()));
        Ok(self.existing.lock().unwrap().clone())
    }

    async fn create_machine(
        &self,
        env_id: &str,
        key_pair_name: &str,
    ) -> Result<Machine, DriverError> {
        self.record(DriverCall::CreateMachine {
            env_id: env_id.to_string(),
            key_pair: key_pair_name.to_string(),
        });
        if self.fail_create {
            return Err(DriverError::failed("create machine", "quota exceeded"));
        }
        let mut created = machine(env_id, &format!("new-{}", env_id), key_pair_name);
        created.from_snapshot = self.boot_from_snapshot;
        Ok(created)
    }

    async fn remove_machine(&self, provider_id: &str) -> Result<(), DriverError> {
        self.record(DriverCall::RemoveMachine(provider_id.to_string()));
        Ok(())
    }

    fn list_key_pairs(&self) -> BoxStream<'_, Result<String, DriverError>> {
        self.record(DriverCall::ListKeyPairs);
        stream::iter(self.key_pairs.clone().into_iter().map(Ok)).boxed()
    }

    async fn create_key_pair(&self, env_id: &str) -> Result<SshKeyPair, DriverError> {
        self.record(DriverCall::CreateKeyPair(env_id.to_string()));
        Ok(key_pair(&format!("key-{}", env_id)))
    }

    async fn on_machine_created(
        &self,
        provider_id: &str,
        _env_id: &str,
        from_snapshot: bool,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::OnMachineCreated {
            provider_id: provider_id.to_string(),
            from_snapshot,
        });
        Ok(())
    }

    async fn ensure_machine_snapshot(
        &self,
        provider_id: &str,
        _env_id: &str,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::EnsureSnapshot(provider_id.to_string()));
        Err(DriverError::failed("snapshot", "not today"))
    }

    fn supports_post_hoc_snapshot(&self) -> bool {
        self.post_hoc_snapshot
    }

    fn key_pair_alias(&self) -> String {
        "fake".to_string()
    }
}

#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, SshKeyPair>>,
}

impl MemoryKeyStore {
    pub fn with(names: &[&str]) -> Self {
        let store = Self::default();
        {
            let mut entries = store.entries.lock().unwrap();
            for name in names {
                entries.insert(name.to_string(), key_pair(name));
            }
        }
        store
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn read(&self, name: &str) -> Result<Option<SshKeyPair>, StoreError> {
        Ok(self.entries.lock().unwrap().get(name).cloned())
    }

    async fn write(&self, name: &str, key_pair: &SshKeyPair) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), key_pair.clone());
        Ok(())
    }
}

/// What sessions did, shared between a session and the test
#[derive(Default)]
pub struct SessionLog {
    commands: Mutex<Vec<String>>,
    disposed: AtomicUsize,
}

impl SessionLog {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Names of `echo <name>` scripts, in run order
    pub fn scripts_run(&self) -> Vec<String> {
        self.commands()
            .iter()
            .filter_map(|c| {
                c.strip_prefix("bash -c 'echo ")
                    .and_then(|rest| rest.strip_suffix('\''))
                    .map(str::to_string)
            })
            .collect()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    log: Arc<SessionLog>,
    fail_on: Option<String>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            log: Arc::new(SessionLog::default()),
            fail_on: None,
        }
    }

    /// Commands containing `pattern` exit 1
    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn log(&self) -> Arc<SessionLog> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec_command(&self, command: &str) -> Result<CommandOutput, SessionError> {
        self.log.commands.lock().unwrap().push(command.to_string());
        let failed = self
            .fail_on
            .as_deref()
            .is_some_and(|pattern| command.contains(pattern));
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: if failed { "boom".to_string() } else { String::new() },
            exit_code: if failed { 1 } else { 0 },
        })
    }

    async fn put_files(&self, _files: &[FileToCopy]) -> Result<(), SessionError> {
        Ok(())
    }

    async fn dispose(&self) {
        self.log.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out [`FakeSession`]s after a number of refused attempts
pub struct FakeConnector {
    pub log: Arc<SessionLog>,
    refuse_first: u32,
    attempts: AtomicU32,
    fail_on: Option<String>,
    targets: Mutex<Vec<ConnectTarget>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            log: Arc::new(SessionLog::default()),
            refuse_first: 0,
            attempts: AtomicU32::new(0),
            fail_on: None,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing(mut self, attempts: u32) -> Self {
        self.refuse_first = attempts;
        self
    }

    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, target: &ConnectTarget) -> Result<FakeSession, ConnectError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.targets.lock().unwrap().push(target.clone());
        if attempt <= self.refuse_first {
            return Err(ConnectError::Unreachable {
                address: target.address(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(FakeSession {
            log: Arc::clone(&self.log),
            fail_on: self.fail_on.clone(),
        })
    }
}
