//! Running shell commands on deployment targets.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::models::DeploymentTarget;
use crate::errors::DeployError;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes a command line on a target host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(
        &self,
        target: &DeploymentTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError>;
}

/// [`RemoteShell`] backed by the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct SshShell {
    binary: PathBuf,
    connect_timeout_secs: u64,
}

impl SshShell {
    pub fn new(binary: impl Into<PathBuf>, connect_timeout_secs: u64) -> Self {
        Self {
            binary: binary.into(),
            connect_timeout_secs,
        }
    }

    /// Arguments passed to `ssh`; the remote command is always last.
    pub fn ssh_args(&self, target: &DeploymentTarget, command: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), target.port.to_string()];
        if let Some(key) = &target.ssh_key_path {
            args.push("-i".into());
            args.push(key.clone());
        }
        for opt in [
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "StrictHostKeyChecking=accept-new".to_string(),
        ] {
            args.push("-o".into());
            args.push(opt);
        }
        args.push(format!("{}@{}", target.username, target.host));
        args.push("--".into());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        target: &DeploymentTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        tracing::debug!(target_name = %target.name, host = %target.host, command = %command, "running remote command");
        let child = Command::new(&self.binary)
            .args(self.ssh_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DeployError::Spawn)?;

        // Dropping the wait future drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(DeployError::Spawn)?,
            Err(_) => {
                tracing::warn!(target_name = %target.name, seconds = timeout.as_secs(), "remote command timed out");
                return Err(DeployError::Timeout {
                    seconds: timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
