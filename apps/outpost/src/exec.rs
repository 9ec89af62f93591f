//! Shell execution for verified command directives.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Ceiling applied to every command unless the runner is built otherwise.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Runs a command string and returns its captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String, ExecError>;
}

/// Runs commands through the platform shell with a hard timeout.
///
/// stdout and stderr are merged into one stream in the order they were
/// written. A non-zero exit is not an error: the output is returned with the
/// exit status appended so the server always sees what the command printed.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(command: &str) -> Command {
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = Command::new("powershell");
            cmd.arg("-Command").arg(format!("& {{ {command} }} 2>&1"));
            cmd
        };
        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            // stderr joins stdout so mixed output keeps its order.
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(format!("exec 2>&1\n{command}"));
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<String, ExecError> {
        let child = Self::command(command).spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(ExecError::TimedOut(self.timeout)),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(status = %output.status, bytes = text.len(), "command finished");

        if output.status.success() {
            Ok(text)
        } else {
            Ok(format!("{text}\nError: {}", output.status))
        }
    }
}
