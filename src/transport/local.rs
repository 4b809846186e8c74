// Local transport: spawn the command through `sh -c`. The builder already
// quoted everything, and the command string legitimately contains shell
// metacharacters, so a shell is required. Used when use_ssh is off or the
// engine runs inside the target pod.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::Host;
use crate::errors::TransportError;

use super::{CommandOutput, Transport};

pub struct LocalTransport {
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput, TransportError> {
        tracing::debug!(host = %host.name, %command, "local exec");
        let started = Instant::now();

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh").arg("-c").arg(command).output(),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            seconds: self.timeout.as_secs(),
        })?
        .map_err(TransportError::Spawn)?;

        let duration = started.elapsed();
        let stdout: String = String::from_utf8_lossy(&output.stdout).into();
        let stderr: String = String::from_utf8_lossy(&output.stderr).into();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            tracing::debug!(host = %host.name, exit_code, "command exited non-zero");
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }
}
