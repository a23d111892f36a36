//! Machine customization scripts
//!
//! Scripts run one at a time over the machine session. Later scripts may
//! rely on what earlier ones installed, so a group stops at the first
//! failure.

use pv_core::error::ScriptError;
use pv_core::shell;
use pv_core::traits::RemoteSession;

/// A named shell script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub body: String,
}

impl Script {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// Remote command line running the script under bash
    fn command(&self) -> String {
        format!("bash -c {}", shell::quote(&self.body))
    }
}

/// The two script groups run during provisioning
#[derive(Debug, Clone, Default)]
pub struct ScriptGroups {
    /// Turn a bare image into a docker host; skipped for snapshots and
    /// reused machines
    pub bare_machine: Vec<Script>,
    /// Run on every `up`; must be safe to repeat
    pub instance_specific: Vec<Script>,
}

impl ScriptGroups {
    /// Scripts shipped with the CLI
    pub fn builtin() -> Self {
        Self {
            bare_machine: vec![
                Script::new(
                    "install-docker",
                    include_str!("../../scripts/bare/01-install-docker.sh"),
                ),
                Script::new(
                    "configure-docker",
                    include_str!("../../scripts/bare/02-configure-docker.sh"),
                ),
                Script::new(
                    "install-tools",
                    include_str!("../../scripts/bare/03-install-tools.sh"),
                ),
            ],
            instance_specific: vec![
                Script::new(
                    "prepare-dirs",
                    include_str!("../../scripts/instance/01-prepare-dirs.sh"),
                ),
                Script::new(
                    "ensure-docker",
                    include_str!("../../scripts/instance/02-ensure-docker.sh"),
                ),
            ],
        }
    }
}

/// Runs scripts over a session, strictly in order
pub struct ScriptExecutor<'a, S: ?Sized> {
    session: &'a S,
}

impl<'a, S: RemoteSession + ?Sized> ScriptExecutor<'a, S> {
    pub fn new(session: &'a S) -> Self {
        Self { session }
    }

    /// Run one script, failing on a non-zero exit
    pub async fn run(&self, script: &Script) -> Result<(), ScriptError> {
        tracing::debug!("Running script {}", script.name);

        let output = self
            .session
            .exec_command(&script.command())
            .await
            .map_err(|source| ScriptError::Session {
                script: script.name.clone(),
                source,
            })?;

        if !output.success() {
            return Err(ScriptError::Failed {
                script: script.name.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run a group; nothing after a failing script runs
    pub async fn run_all(&self, scripts: &[Script]) -> Result<(), ScriptError> {
        for script in scripts {
            self.run(script).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    fn scripts(names: &[&str]) -> Vec<Script> {
        names
            .iter()
            .map(|n| Script::new(*n, format!("echo {}", n)))
            .collect()
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let session = FakeSession::new();
        ScriptExecutor::new(&session)
            .run_all(&scripts(&["one", "two", "three"]))
            .await
            .unwrap();

        assert_eq!(session.log().scripts_run(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let session = FakeSession::new().failing_on("echo two");
        let err = ScriptExecutor::new(&session)
            .run_all(&scripts(&["one", "two", "three"]))
            .await
            .unwrap_err();

        match err {
            ScriptError::Failed {
                script, exit_code, ..
            } => {
                assert_eq!(script, "two");
                assert_eq!(exit_code, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.log().scripts_run(), vec!["one", "two"]);
    }

    #[test]
    fn test_builtin_groups() {
        let groups = ScriptGroups::builtin();
        assert_eq!(groups.bare_machine.len(), 3);
        assert_eq!(groups.instance_specific.len(), 2);
        assert!(groups
            .bare_machine
            .iter()
            .chain(&groups.instance_specific)
            .all(|s| s.body.starts_with("#!/usr/bin/env bash")));
    }

    #[test]
    fn test_command_quotes_body() {
        let script = Script::new("quote", "echo 'hi'");
        assert_eq!(script.command(), r"bash -c 'echo '\''hi'\'''");
    }
}
