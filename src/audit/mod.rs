// Module: Audit
// Wraps the flow runner for audit mode: validation is forced strict
// (array order preserved, subset matching off, no threshold fallback) and
// every step is appended to an audit trail. A step that lenient (OTP)
// validation would have passed but strict validation fails is downgraded
// to FAIL with category AuditStrictFail, keeping the OTP outcome in the
// record.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, Host};
use crate::errors::FailureKind;
use crate::executor::FlowRunner;
use crate::orchestrator::FlowDriver;
use crate::report::{ResultSink, StepOutcome, TestResult};
use crate::response;
use crate::suite::{TestFlow, TestStep};
use crate::validation::{self, Strictness};

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// `sheet:row` of the audited step.
    pub step_id: String,
    pub test_name: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub differences: Option<String>,
    pub outcome: StepOutcome,
    /// What lenient (OTP) validation would have said, when it diverges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp_outcome: Option<StepOutcome>,
    pub ts: DateTime<Utc>,
}

#[derive(Default)]
pub struct AuditTrail {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn append(&self, record: AuditRecord) {
        self.records.lock().expect("audit trail poisoned").push(record);
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit trail poisoned").clone()
    }

    pub fn write_json(&self, dir: &Path, started: DateTime<Utc>) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("audit_trail_{}.json", started.format("%Y%m%d_%H%M%S")));
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

pub struct AuditRunner {
    runner: FlowRunner,
    config: Arc<EngineConfig>,
    trail: Arc<AuditTrail>,
}

impl AuditRunner {
    /// `runner` must be configured with `Strictness::Strict`.
    pub fn new(runner: FlowRunner, config: Arc<EngineConfig>, trail: Arc<AuditTrail>) -> Self {
        Self {
            runner,
            config,
            trail,
        }
    }

    /// Rebuilds enough of the response to re-run validation leniently.
    fn reconstruct(result: &TestResult) -> response::HttpResponse {
        let trace = result
            .actual_status
            .map(|status| format!("< HTTP/1.1 {} X\n", status))
            .unwrap_or_default();
        response::parse(
            result.response_body.as_deref().unwrap_or(""),
            &trace,
            Duration::from_millis(result.duration_ms),
        )
    }

    fn audit_step(&self, step: &TestStep, result: &mut TestResult) {
        let strict_failed_validation = result.is_failure()
            && matches!(
                result.failure_kind.as_deref(),
                Some("PatternMismatch") | Some("PayloadMismatch")
            );

        let mut otp_outcome = None;
        if strict_failed_validation {
            let lenient = validation::validate(
                step,
                &Self::reconstruct(result),
                &self.config.validation_settings,
                &self.config.payloads_dir,
                Strictness::Lenient,
            );
            if lenient.passed {
                otp_outcome = Some(StepOutcome::Pass);
                let strict_reason = result.fail_reason.take().unwrap_or_default();
                result.set_failure(
                    FailureKind::AuditStrictFail,
                    format!("passed OTP validation but failed strict audit: {}", strict_reason),
                );
            }
        }

        self.trail.append(AuditRecord {
            step_id: format!("{}:{}", result.sheet, result.row_idx),
            test_name: result.test_name.clone(),
            host: result.host.clone(),
            pattern: result.pattern.clone(),
            actual_status: result.actual_status,
            actual_body: result.response_body.clone(),
            differences: result.fail_reason.clone(),
            outcome: result.outcome,
            otp_outcome,
            ts: Utc::now(),
        });
    }
}

#[async_trait]
impl FlowDriver for AuditRunner {
    async fn run_flow(
        &self,
        flow: &TestFlow,
        host: &Host,
        cancel: &CancellationToken,
        sink: &dyn ResultSink,
    ) -> Vec<TestResult> {
        let mut results = self.runner.run_flow(flow, host, cancel, sink).await;
        for result in &mut results {
            if let Some(step) = flow.steps.iter().find(|s| s.row_idx == result.row_idx) {
                self.audit_step(step, result);
            }
        }
        results
    }
}
