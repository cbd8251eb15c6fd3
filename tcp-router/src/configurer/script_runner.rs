//! Reload action invocation.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ReloadError;

/// An external action that makes the load balancer pick up a new configuration.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run the action to completion. Exit code 0 is success.
    async fn run(&self) -> Result<(), ReloadError>;
}

/// Runs an executable as a child process with a bounded wait.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    /// Run the executable at `path`, killing it after `timeout`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScriptRunner for CommandRunner {
    async fn run(&self) -> Result<(), ReloadError> {
        tracing::debug!(script = %self.path.display(), "running reload script");

        let child = Command::new(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ReloadError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ReloadError::Spawn {
                    path: self.path.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ReloadError::Timeout {
                    path: self.path.clone(),
                    timeout: self.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            tracing::debug!(stdout = %stdout.trim(), "reload script succeeded");
            Ok(())
        } else {
            tracing::warn!(
                status = %output.status,
                stdout = %stdout.trim(),
                stderr = %stderr.trim(),
                "reload script failed"
            );
            Err(ReloadError::Failed {
                path: self.path.clone(),
                status: output.status.to_string(),
            })
        }
    }
}
