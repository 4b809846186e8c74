// Module: Report
// TestResult and run-level aggregation, the console FAIL one-liners, the
// pipe-separated structured failure log, and the JSON results file.
// Excel/HTML renderings are produced by external generators from the
// same JSON document.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::FailureKind;
use crate::suite::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "DRY-RUN")]
    DryRun,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepOutcome::Pass => "PASS",
            StepOutcome::Fail => "FAIL",
            StepOutcome::Skipped => "SKIPPED",
            StepOutcome::DryRun => "DRY-RUN",
        };
        write!(f, "{}", s)
    }
}

/// One step on one host in one flow attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub sheet: String,
    pub row_idx: usize,
    pub host: String,
    pub test_name: String,
    pub method: Method,
    pub outcome: StepOutcome,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<String>,
    pub duration_ms: u64,
    pub command: String,
    pub expected_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_found: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub output_length: usize,
    pub error_length: usize,
    pub timestamp: DateTime<Utc>,
}

impl TestResult {
    pub fn is_failure(&self) -> bool {
        self.outcome == StepOutcome::Fail
    }

    pub fn set_failure(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.outcome = StepOutcome::Fail;
        self.passed = false;
        self.failure_kind = Some(kind.to_string());
        self.fail_reason = Some(reason.into());
    }

    /// `[FAIL][sheet][row N][host] Reason`, one line per failed step.
    pub fn console_line(&self) -> Option<String> {
        if !self.is_failure() {
            return None;
        }
        Some(format!(
            "[FAIL][{}][row {}][{}] {}",
            self.sheet,
            self.row_idx,
            self.host,
            self.fail_reason.as_deref().unwrap_or("unknown")
        ))
    }
}

/// Pipe-separated structured failure record.
pub const FAILURE_LOG_HEADER: &str = "SHEET|ROW|HOST|TEST_NAME|COMMAND|REASON|EXPECTED_STATUS|ACTUAL_STATUS|PATTERN_MATCH|PATTERN_FOUND|OUTPUT_LENGTH|ERROR_LENGTH";

fn sanitize(field: &str) -> String {
    field.replace('|', "/").replace(['\n', '\r'], " ")
}

pub fn failure_line(result: &TestResult) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        sanitize(&result.sheet),
        result.row_idx,
        sanitize(&result.host),
        sanitize(&result.test_name),
        sanitize(&result.command),
        sanitize(result.fail_reason.as_deref().unwrap_or("")),
        sanitize(&result.expected_status),
        result
            .actual_status
            .map(|s| s.to_string())
            .unwrap_or_default(),
        sanitize(result.pattern.as_deref().unwrap_or("")),
        result
            .pattern_found
            .map(|b| b.to_string())
            .unwrap_or_default(),
        result.output_length,
        result.error_length,
    )
}

/// Appends failure records to the structured failure log.
pub struct FailureLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl FailureLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", FAILURE_LOG_HEADER)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    pub fn record(&self, result: &TestResult) {
        if !result.is_failure() {
            return;
        }
        let mut writer = self.writer.lock().expect("failure log poisoned");
        let _ = writeln!(writer, "{}", failure_line(result));
        let _ = writer.flush();
    }
}

/// Opaque consumer of results as they happen (dashboards, progress
/// displays). The engine works with the no-op sink.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: &TestResult);
}

pub struct NoopSink;

impl ResultSink for NoopSink {
    fn on_result(&self, _result: &TestResult) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_steps: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub dry_run: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn from_results(results: &[TestResult], duration_ms: u64) -> Self {
        let count = |outcome: StepOutcome| results.iter().filter(|r| r.outcome == outcome).count();
        Self {
            total_steps: results.len(),
            passed: count(StepOutcome::Pass),
            failed: count(StepOutcome::Fail),
            skipped: count(StepOutcome::Skipped),
            dry_run: count(StepOutcome::DryRun),
            duration_ms,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Top-level document written to test_results/.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub summary: RunSummary,
    pub results: Vec<TestResult>,
}

impl RunReport {
    /// Writes `test_results/test_results_<ts>.json`; the xlsx/html
    /// renderings are generated externally from this file.
    pub fn write_json(&self, results_dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(results_dir)?;
        let stamp = self.started.format("%Y%m%d_%H%M%S");
        let path = results_dir.join(format!("test_results_{}.json", stamp));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}
