//! # Orchestrator - Flows × Hosts Fan-Out
//!
//! Schedules every flow on every selected host and aggregates the
//! results. The scheduling model is deliberately simple:
//!
//! 1. **One worker task per host.** A worker runs that host's flows
//!    sequentially, so two flows touching the same host can never
//!    interleave. Same-host NRF sequences are serialized by
//!    construction, not by locking.
//! 2. **Hosts run in parallel**, bounded by a semaphore sized to the
//!    host count (`JoinSet` + `Semaphore`).
//! 3. **Results stream** to the `ResultSink` as they happen and are
//!    collected for the final report. Cross-host ordering is not
//!    promised; within a flow, step order is.
//!
//! ```text
//!                    ┌─────────────────┐
//!        flows ─────▶│  orchestrator   │
//!                    └───┬───────┬─────┘
//!            worker(host-a)   worker(host-b)      ... bounded
//!                    │           │
//!           flow 1 → flow 2 → …  │  (sequential per host)
//!                    │           │
//!                    ▼           ▼
//!              TestResults ──▶ sink ──▶ report
//! ```
//!
//! ## Cancellation
//!
//! Two tokens, two escalation levels:
//!
//! - **Soft cancel**: workers accept no further flows; the step in
//!   flight finishes and emits its result.
//! - **Hard cancel**: soft cancel plus a grace window (5s), after which
//!   outstanding workers are aborted outright.
//!
//! The binary maps the first Ctrl-C to soft and the second to hard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{EngineConfig, Host};
use crate::executor::FlowRunner;
use crate::report::{ResultSink, TestResult};
use crate::suite::TestFlow;

/// Grace window between a hard cancel and task abort.
const HARD_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// The per-flow execution capability the orchestrator drives; the plain
/// runner and the audit adapter both provide it.
#[async_trait]
pub trait FlowDriver: Send + Sync {
    async fn run_flow(
        &self,
        flow: &TestFlow,
        host: &Host,
        cancel: &CancellationToken,
        sink: &dyn ResultSink,
    ) -> Vec<TestResult>;
}

#[async_trait]
impl FlowDriver for FlowRunner {
    async fn run_flow(
        &self,
        flow: &TestFlow,
        host: &Host,
        cancel: &CancellationToken,
        sink: &dyn ResultSink,
    ) -> Vec<TestResult> {
        FlowRunner::run_flow(self, flow, host, cancel, sink).await
    }
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    driver: Arc<dyn FlowDriver>,
    soft_cancel: CancellationToken,
    hard_cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Arc<EngineConfig>, driver: Arc<dyn FlowDriver>) -> Self {
        Self {
            config,
            driver,
            soft_cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
        }
    }

    /// Stops accepting new flows; in-flight steps finish and emit results.
    pub fn soft_cancel_token(&self) -> CancellationToken {
        self.soft_cancel.clone()
    }

    /// After the grace window, outstanding workers are aborted.
    pub fn hard_cancel_token(&self) -> CancellationToken {
        self.hard_cancel.clone()
    }

    /// Runs every flow on every selected host.
    pub async fn run(
        &self,
        flows: Vec<TestFlow>,
        sink: Arc<dyn ResultSink>,
    ) -> Vec<TestResult> {
        let hosts: Vec<Host> = match self.config.selected_hosts() {
            Ok(hosts) => hosts.into_iter().cloned().collect(),
            Err(e) => {
                warn!(error = %e, "host selection failed");
                return Vec::new();
            }
        };
        if hosts.is_empty() {
            warn!("no hosts selected; nothing to run");
            return Vec::new();
        }

        info!(
            flows = flows.len(),
            hosts = hosts.len(),
            "orchestrating {} flow executions",
            flows.len() * hosts.len()
        );

        let semaphore = Arc::new(Semaphore::new(hosts.len()));
        let flows = Arc::new(flows);
        let mut join_set = JoinSet::new();

        for host in hosts {
            let driver = Arc::clone(&self.driver);
            let flows = Arc::clone(&flows);
            let sink = Arc::clone(&sink);
            let soft = self.soft_cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut results = Vec::new();
                for flow in flows.iter() {
                    if soft.is_cancelled() {
                        info!(host = %host.name, "soft cancel: no further flows accepted");
                        break;
                    }
                    results.extend(driver.run_flow(flow, &host, &soft, sink.as_ref()).await);
                }
                results
            });
        }

        let mut all_results = Vec::new();
        let mut hard_fired = false;
        let mut abort_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = self.hard_cancel.cancelled(), if !hard_fired => {
                    hard_fired = true;
                    warn!("hard cancel requested; {}s grace before abort", HARD_CANCEL_GRACE.as_secs());
                    self.soft_cancel.cancel();
                    abort_deadline = Some(tokio::time::Instant::now() + HARD_CANCEL_GRACE);
                }
                _ = async {
                    // Grace expired: kill whatever is still running.
                    match abort_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                }, if abort_deadline.is_some() => {
                    warn!("hard cancel grace expired; aborting workers");
                    join_set.abort_all();
                    abort_deadline = None;
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(results)) => all_results.extend(results),
                        Some(Err(e)) if e.is_cancelled() => {
                            warn!("worker aborted before completion");
                        }
                        Some(Err(e)) => warn!(error = %e, "worker panicked"),
                    }
                }
            }
        }

        all_results
    }
}
