// Module: Transport
// A single capability (run a command against a host, hand back what it
// wrote) with three implementations: local subprocess, SSH, and the
// mock-server reroute. The flow executor sees only the trait.

pub mod local;
pub mod mock;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Host, KubeCli};
use crate::errors::TransportError;

/// Captured output of one command invocation. A non-zero exit code is
/// data, not an error: curl reports HTTP failures via the status line.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput, TransportError>;
}

/// Probes which Kubernetes CLI a host carries. Called once per host; the
/// caller caches the answer.
pub async fn detect_cli(transport: &dyn Transport, host: &Host) -> Option<KubeCli> {
    if let Some(configured) = host.cli {
        return Some(configured);
    }
    for cli in [KubeCli::Kubectl, KubeCli::Oc] {
        let probe = format!("{} version --client", cli.binary());
        match transport.execute(&probe, host).await {
            Ok(output) if output.exit_code == 0 => {
                tracing::debug!(host = %host.name, cli = cli.binary(), "kubernetes cli detected");
                return Some(cli);
            }
            _ => {}
        }
    }
    None
}
