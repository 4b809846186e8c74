//! # Flow Executor - One Flow, One Host, Steps In Order
//!
//! This is the heart of the engine. It takes one flow (the rows sharing a
//! Test_Name) and drives its steps sequentially against a single host,
//! producing one `TestResult` per step.
//!
//! ## What a step goes through
//!
//! 1. **Build**: assemble the curl/kubectl command (placeholders resolved,
//!    NRF URLs rewritten). A build-time skip sentinel becomes a SKIPPED
//!    result and the flow moves on.
//! 2. **Dry-run gate**: with `--dry-run` the built command is the result;
//!    nothing executes.
//! 3. **Rate gate**: wait for a token from the per-host bucket.
//! 4. **Execute**: run the command through the transport, concurrently
//!    capturing pod logs when the step names a pod and log capture is on.
//! 5. **Parse**: reconstruct status/headers/body from the verbose trace.
//! 6. **Validate**: status, pattern, reference payload, in that order.
//! 7. **Side effects**: apply Save_As / Compare_With against the flow
//!    context so later steps can consume the values.
//!
//! ```text
//! step ──▶ build ──▶ rate gate ──▶ transport ──▶ parse ──▶ validate
//!            │                         │                      │
//!            │ skip sentinel           │ pod logs             ▼
//!            ▼                         ▼               save / compare
//!        SKIPPED result         attached to the            │
//!                               response for matching      ▼
//!                                                     TestResult
//! ```
//!
//! ## Failure policy
//!
//! A failing step does **not** abort the flow: teardown DELETEs at the
//! end of a sequence must still run. `stop_on_failure` flips that. A
//! transport error is a failed step, never a crash; a cancellation
//! request is honored between steps.
//!
//! ## Example flow
//!
//! ```text
//! row 2  POST /login            expect 200   Save_As: token
//! row 3  GET  /me               expect 200   header: Bearer {token}
//! row 4  DELETE /session        expect 204
//! ```
//!
//! Row 3's header is interpolated from the value row 2 saved; if row 2
//! saved nothing, row 3 fails with MissingSavedValue and row 4 still runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{BuiltCommand, CommandBuilder};
use crate::config::{EngineConfig, Host, KubeCli};
use crate::context::FlowContext;
use crate::errors::{BuildError, FailureKind};
use crate::limiter::RateGate;
use crate::nrf::{session_key, InstanceTracker, TrackContext};
use crate::pattern;
use crate::report::{ResultSink, StepOutcome, TestResult};
use crate::response::{self, HttpResponse};
use crate::suite::{TestFlow, TestStep};
use crate::transport::{self, Transport};
use crate::validation::{self, Strictness};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub strictness: Strictness,
    pub dry_run: bool,
    pub step_delay: Duration,
    /// Mock execution: tag requests with X-Test-Sheet/X-Test-Name so the
    /// mock server can key its recorded responses.
    pub mock_mode: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            strictness: Strictness::Lenient,
            dry_run: false,
            step_delay: Duration::ZERO,
            mock_mode: false,
        }
    }
}

pub struct FlowRunner {
    config: Arc<EngineConfig>,
    builder: CommandBuilder,
    transport: Arc<dyn Transport>,
    limiter: Arc<RateGate>,
    tracker: Arc<InstanceTracker>,
    options: ExecutorOptions,
    resources: HashMap<String, String>,
    cli_cache: Mutex<HashMap<String, Option<KubeCli>>>,
}

impl FlowRunner {
    pub fn new(
        config: Arc<EngineConfig>,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateGate>,
        tracker: Arc<InstanceTracker>,
        options: ExecutorOptions,
        resources: HashMap<String, String>,
    ) -> Self {
        let builder = CommandBuilder::new(Arc::clone(&config), Arc::clone(&tracker));
        Self {
            config,
            builder,
            transport,
            limiter,
            tracker,
            options,
            resources,
            cli_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one flow to completion. Results come back in step order.
    pub async fn run_flow(
        &self,
        flow: &TestFlow,
        host: &Host,
        cancel: &CancellationToken,
        sink: &dyn ResultSink,
    ) -> Vec<TestResult> {
        let session = session_key(&flow.sheet, &flow.test_name, &host.name);
        let mut ctx = if self.config.pod_mode {
            FlowContext::with_resources(self.resources.clone())
        } else {
            FlowContext::new()
        };
        let mut results = Vec::with_capacity(flow.steps.len());

        info!(
            sheet = %flow.sheet,
            test_name = %flow.test_name,
            host = %host.name,
            steps = flow.steps.len(),
            "flow starting"
        );

        for step in &flow.steps {
            if cancel.is_cancelled() {
                info!(test_name = %flow.test_name, "cancellation requested; flow stopped");
                break;
            }

            let result = self.run_step(flow, step, host, &session, &mut ctx).await;
            sink.on_result(&result);
            let failed = result.is_failure();
            results.push(result);

            if failed && self.config.stop_on_failure {
                warn!(test_name = %flow.test_name, "stop_on_failure: aborting flow");
                break;
            }
            if !self.options.step_delay.is_zero() {
                tokio::time::sleep(self.options.step_delay).await;
            }
        }

        if self.config.nrf_tracking_enabled() {
            self.tracker.end_session(&session);
            debug!(
                session = %session,
                diagnostic = ?self.tracker.diagnostic(&session),
                "nrf session closed"
            );
        }
        results
    }

    fn base_result(&self, flow: &TestFlow, step: &TestStep, host: &Host) -> TestResult {
        TestResult {
            sheet: flow.sheet.clone(),
            row_idx: step.row_idx,
            host: host.name.clone(),
            test_name: flow.test_name.clone(),
            method: step.method,
            outcome: StepOutcome::Pass,
            passed: true,
            fail_reason: None,
            failure_kind: None,
            duration_ms: 0,
            command: String::new(),
            expected_status: step.expected_status.clone(),
            actual_status: None,
            pattern: step.pattern_match.clone(),
            pattern_found: None,
            response_body: None,
            output_length: 0,
            error_length: 0,
            timestamp: Utc::now(),
        }
    }

    async fn run_step(
        &self,
        flow: &TestFlow,
        step: &TestStep,
        host: &Host,
        session: &str,
        ctx: &mut FlowContext,
    ) -> TestResult {
        let mut result = self.base_result(flow, step, host);
        let track = TrackContext {
            sheet: flow.sheet.clone(),
            test_name: flow.test_name.clone(),
            row_idx: step.row_idx,
        };

        let tagged;
        let step = if self.options.mock_mode {
            tagged = with_mock_headers(step, flow);
            &tagged
        } else {
            step
        };

        let cli = if step.pod_exec.is_some() && !self.config.pod_mode {
            self.resolve_cli(host).await
        } else {
            None
        };

        let built = match self.builder.build(step, &track, session, host, cli, ctx) {
            Ok(built) => built,
            Err(BuildError::UnresolvedPlaceholder { name })
                if saved_upstream(flow, step, &name) =>
            {
                result.set_failure(
                    FailureKind::MissingSavedValue,
                    format!("saved value '{}' is not available", name),
                );
                return result;
            }
            Err(e) => {
                result.set_failure(FailureKind::Build, e.to_string());
                return result;
            }
        };

        let command = match built {
            BuiltCommand::Skip { reason } => {
                warn!(
                    row = step.row_idx,
                    test_name = %flow.test_name,
                    %reason,
                    "step skipped"
                );
                result.outcome = StepOutcome::Skipped;
                result.passed = false;
                result.failure_kind = Some(FailureKind::NrfNoActiveInstance.to_string());
                result.fail_reason = Some(reason);
                return result;
            }
            BuiltCommand::Execute { command, .. } => command,
        };
        result.command = command.clone();

        if self.options.dry_run {
            info!(row = step.row_idx, %command, "dry-run");
            result.outcome = StepOutcome::DryRun;
            return result;
        }

        let waited = self.limiter.acquire(&host.name, step.reqs_per_sec).await;
        if waited > Duration::ZERO {
            debug!(host = %host.name, waited_ms = waited.as_millis() as u64, "rate limited");
        }

        let budget = Duration::from_secs(self.config.step_timeout);
        let joined = tokio::time::timeout(budget, async {
            tokio::join!(
                self.transport.execute(&command, host),
                self.capture_logs(step, host, cli, budget)
            )
        })
        .await;

        let (executed, logs) = match joined {
            Ok(pair) => pair,
            Err(_) => {
                result.set_failure(
                    FailureKind::Transport,
                    format!("step exceeded its {}s budget", self.config.step_timeout),
                );
                return result;
            }
        };

        let output = match executed {
            Ok(output) => output,
            Err(e) => {
                result.set_failure(FailureKind::Transport, e.to_string());
                return result;
            }
        };

        let mut parsed = response::parse(&output.stdout, &output.stderr, output.duration);
        parsed.log_text = logs;
        result.actual_status = Some(parsed.status_code);
        result.duration_ms = parsed.duration_ms;
        result.output_length = output.stdout.len();
        result.error_length = output.stderr.len();
        if !parsed.body_text.is_empty() {
            result.response_body = Some(parsed.body_text.clone());
        }

        let verdict = validation::validate(
            step,
            &parsed,
            &self.config.validation_settings,
            &self.config.payloads_dir,
            self.options.strictness,
        );
        result.pattern_found = verdict.pattern_found;
        if !verdict.passed {
            result.set_failure(
                verdict.kind.unwrap_or(FailureKind::Internal),
                verdict.reason.unwrap_or_else(|| "validation failed".to_string()),
            );
            return result;
        }

        if let Some((kind, reason)) = self.apply_side_effects(step, &parsed, ctx) {
            result.set_failure(kind, reason);
            return result;
        }

        result
    }

    /// Save_As / Compare_With run only after a passing validation.
    fn apply_side_effects(
        &self,
        step: &TestStep,
        response: &HttpResponse,
        ctx: &mut FlowContext,
    ) -> Option<(FailureKind, String)> {
        let body = response.body_json.clone().unwrap_or(Value::Null);

        if let Some(selector) = &step.save_as {
            let target = target_name(selector);
            match pattern::extract(&body, selector) {
                Some(value) if !value.is_null() => {
                    debug!(target = %target, "saved value captured");
                    ctx.save(target, value);
                }
                _ => warn!(
                    selector = %selector,
                    row = step.row_idx,
                    "save_as found nothing in the response"
                ),
            }
        }

        if let Some(selector) = &step.compare_with {
            let name = target_name(selector);
            let Some(saved) = ctx.saved_value(&name).cloned() else {
                return Some((
                    FailureKind::MissingSavedValue,
                    format!("no saved value '{}' to compare against", name),
                ));
            };
            match pattern::extract(&body, selector) {
                Some(actual) if actual == saved => {}
                Some(actual) => {
                    return Some((
                        FailureKind::ComparisonMismatch,
                        format!("'{}': response {} != saved {}", name, actual, saved),
                    ))
                }
                None => {
                    return Some((
                        FailureKind::ComparisonMismatch,
                        format!("'{}' not present in the response", name),
                    ))
                }
            }
        }

        None
    }

    /// Concurrent pod-log capture: wait out the window (bounded by the
    /// remaining step budget), then pull logs covering it.
    async fn capture_logs(
        &self,
        step: &TestStep,
        host: &Host,
        cli: Option<KubeCli>,
        budget: Duration,
    ) -> Option<String> {
        if self.config.pod_mode || !self.config.kubectl_logs_settings.enabled {
            return None;
        }
        let pod = step.pod_exec.as_ref()?;
        let cli = cli?;
        let settings = &self.config.kubectl_logs_settings;
        let window = Duration::from_secs(settings.capture_duration).min(budget);
        tokio::time::sleep(window).await;

        let namespace = host.namespace().unwrap_or_else(|| "default".to_string());
        let command = format!(
            "{} logs {} -n {} --since={}",
            cli.binary(),
            pod,
            namespace,
            settings.since_duration
        );
        match self.transport.execute(&command, host).await {
            Ok(output) if output.exit_code == 0 => Some(output.stdout),
            Ok(output) => {
                debug!(exit_code = output.exit_code, "log capture exited non-zero");
                None
            }
            Err(e) => {
                debug!(error = %e, "log capture failed");
                None
            }
        }
    }

    async fn resolve_cli(&self, host: &Host) -> Option<KubeCli> {
        if let Some(cached) = self
            .cli_cache
            .lock()
            .expect("cli cache poisoned")
            .get(&host.name)
        {
            return *cached;
        }
        let detected = transport::detect_cli(self.transport.as_ref(), host).await;
        self.cli_cache
            .lock()
            .expect("cli cache poisoned")
            .insert(host.name.clone(), detected);
        detected
    }
}

/// The context variable a Save_As/Compare_With selector binds: the last
/// identifier of a path ("$.data.token" -> "token"), or the selector
/// itself for a bare key.
fn target_name(selector: &str) -> String {
    selector
        .trim()
        .trim_end_matches(']')
        .rsplit(['.', '['])
        .next()
        .unwrap_or(selector)
        .to_string()
}

/// Whether an earlier step in the flow promises this name via Save_As;
/// distinguishes MissingSavedValue from a plain build error.
fn saved_upstream(flow: &TestFlow, step: &TestStep, name: &str) -> bool {
    flow.steps
        .iter()
        .filter(|s| s.row_idx < step.row_idx)
        .filter_map(|s| s.save_as.as_deref())
        .any(|selector| target_name(selector) == name)
}

fn with_mock_headers(step: &TestStep, flow: &TestFlow) -> TestStep {
    let mut step = step.clone();
    step.headers
        .push(("X-Test-Sheet".to_string(), flow.sheet.clone()));
    step.headers
        .push(("X-Test-Name".to_string(), flow.test_name.clone()));
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::report::NoopSink;
    use crate::suite::Method;
    use crate::transport::CommandOutput;
    use async_trait::async_trait;
    use serde_json::json;

    /// Scripted transport: records commands, pops canned outputs in order.
    struct Scripted {
        commands: Mutex<Vec<String>>,
        outputs: Mutex<Vec<CommandOutput>>,
    }

    impl Scripted {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                outputs: Mutex::new(outputs),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn execute(
            &self,
            command: &str,
            _host: &Host,
        ) -> Result<CommandOutput, TransportError> {
            self.commands.lock().unwrap().push(command.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                return Err(TransportError::Mock("script exhausted".to_string()));
            }
            Ok(outputs.remove(0))
        }
    }

    fn http(status: u16, body: &str) -> CommandOutput {
        CommandOutput {
            stdout: body.to_string(),
            stderr: format!("< HTTP/1.1 {} X\n< content-type: application/json\n", status),
            exit_code: 0,
            duration: Duration::from_millis(5),
        }
    }

    fn config(nf_name: &str) -> Arc<EngineConfig> {
        Arc::new(
            serde_json::from_value(json!({
                "nf_name": nf_name,
                "hosts": [{"name": "nrf-1"}]
            }))
            .unwrap(),
        )
    }

    fn runner(
        config: Arc<EngineConfig>,
        transport: Arc<dyn Transport>,
        options: ExecutorOptions,
    ) -> FlowRunner {
        FlowRunner::new(
            config,
            transport,
            Arc::new(RateGate::disabled()),
            Arc::new(InstanceTracker::new(HashMap::new())),
            options,
            HashMap::new(),
        )
    }

    fn step(row: usize, method: Method, url: &str, expected: &str) -> TestStep {
        TestStep {
            row_idx: row,
            method,
            url: url.to_string(),
            headers: Vec::new(),
            payload: None,
            expected_status: expected.to_string(),
            pattern_match: None,
            response_payload: None,
            pod_exec: None,
            save_as: None,
            compare_with: None,
            reqs_per_sec: None,
        }
    }

    fn flow(steps: Vec<TestStep>) -> TestFlow {
        TestFlow {
            sheet: "smoke".to_string(),
            test_name: "nrf_register_read_delete".to_string(),
            steps,
        }
    }

    async fn run(runner: &FlowRunner, flow: &TestFlow) -> Vec<TestResult> {
        let host: Host = serde_json::from_value(json!({"name": "nrf-1"})).unwrap();
        runner
            .run_flow(flow, &host, &CancellationToken::new(), &NoopSink)
            .await
    }

    #[tokio::test]
    async fn test_nrf_register_read_delete_end_to_end() {
        let base = "http://nrf:8081/nnrf-nfm/v1/nf-instances/";
        let mut put = step(2, Method::Put, base, "201");
        put.payload = Some(r#"{"nfInstanceId":"abc-123","nfType":"SMF"}"#.to_string());
        let mut get = step(3, Method::Get, base, "200");
        get.pattern_match = Some(r#""nfStatus":"REGISTERED""#.to_string());
        let delete = step(4, Method::Delete, base, "204");

        let transport = Arc::new(Scripted::new(vec![
            http(201, r#"{"nfInstanceId":"abc-123"}"#),
            http(200, r#"{"nfStatus":"REGISTERED"}"#),
            http(204, ""),
        ]));
        let config = config("nrf");
        let tracker = Arc::new(InstanceTracker::new(HashMap::new()));
        let runner = FlowRunner::new(
            Arc::clone(&config),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(RateGate::disabled()),
            Arc::clone(&tracker),
            ExecutorOptions::default(),
            HashMap::new(),
        );

        let f = flow(vec![put, get, delete]);
        let results = run(&runner, &f).await;

        assert_eq!(results.len(), 3);
        assert!(
            results.iter().all(|r| r.outcome == StepOutcome::Pass),
            "all three steps must pass: {:?}",
            results.iter().map(|r| &r.fail_reason).collect::<Vec<_>>()
        );
        // Results arrive in step order.
        assert_eq!(
            results.iter().map(|r| r.row_idx).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        // GET and DELETE were rewritten to target the registered id.
        let commands = transport.commands();
        assert!(commands[1].contains("/nf-instances/abc-123"));
        assert!(commands[2].contains("/nf-instances/abc-123"));
        // Flow teardown leaves no active instances.
        let session = session_key("smoke", "nrf_register_read_delete", "nrf-1");
        assert_eq!(tracker.active_count(&session), 0);
    }

    #[tokio::test]
    async fn test_double_delete_is_skipped_without_http_call() {
        let base = "http://nrf:8081/nnrf-nfm/v1/nf-instances/";
        let mut put = step(2, Method::Put, base, "201");
        put.payload = Some(r#"{"nfInstanceId":"abc-123"}"#.to_string());
        let delete1 = step(3, Method::Delete, base, "204");
        let delete2 = step(4, Method::Delete, base, "204");

        let transport = Arc::new(Scripted::new(vec![http(201, ""), http(204, "")]));
        let runner = runner(
            config("nrf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(&runner, &flow(vec![put, delete1, delete2])).await;
        assert_eq!(results[2].outcome, StepOutcome::Skipped);
        assert_eq!(
            results[2].failure_kind.as_deref(),
            Some("NRFNoActiveInstance")
        );
        assert!(!results[2].is_failure(), "a skip is not a hard failure");
        assert_eq!(
            transport.commands().len(),
            2,
            "no HTTP call may be issued for the second DELETE"
        );
    }

    #[tokio::test]
    async fn test_save_as_feeds_later_placeholders() {
        let mut login = step(2, Method::Post, "http://api/login", "200");
        login.save_as = Some("token".to_string());
        let mut me = step(3, Method::Get, "http://api/me", "200");
        me.headers = vec![("Authorization".to_string(), "Bearer {token}".to_string())];

        let transport = Arc::new(Scripted::new(vec![
            http(200, r#"{"token":"T"}"#),
            http(200, r#"{"user":"u"}"#),
        ]));
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(&runner, &flow(vec![login, me])).await;
        assert!(results.iter().all(|r| r.outcome == StepOutcome::Pass));
        assert!(
            transport.commands()[1].contains("Bearer T"),
            "saved token must be substituted into the header"
        );
    }

    #[tokio::test]
    async fn test_missing_saved_value_fails_the_consumer_step() {
        // Step A saves nothing (token absent from response) but passes;
        // step B then cannot resolve {token}.
        let mut login = step(2, Method::Post, "http://api/login", "200");
        login.save_as = Some("token".to_string());
        let mut me = step(3, Method::Get, "http://api/me", "200");
        me.headers = vec![("Authorization".to_string(), "Bearer {token}".to_string())];

        let transport = Arc::new(Scripted::new(vec![http(200, r#"{"no_token":1}"#)]));
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(&runner, &flow(vec![login, me])).await;
        assert_eq!(results[0].outcome, StepOutcome::Pass);
        assert_eq!(results[1].outcome, StepOutcome::Fail);
        assert_eq!(
            results[1].failure_kind.as_deref(),
            Some("MissingSavedValue")
        );
    }

    #[tokio::test]
    async fn test_compare_with_mismatch() {
        let mut first = step(2, Method::Get, "http://api/a", "200");
        first.save_as = Some("token".to_string());
        let mut second = step(3, Method::Get, "http://api/b", "200");
        second.compare_with = Some("token".to_string());

        let transport = Arc::new(Scripted::new(vec![
            http(200, r#"{"token":"T1"}"#),
            http(200, r#"{"token":"T2"}"#),
        ]));
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(&runner, &flow(vec![first, second])).await;
        assert_eq!(results[1].outcome, StepOutcome::Fail);
        assert_eq!(
            results[1].failure_kind.as_deref(),
            Some("ComparisonMismatch")
        );
    }

    #[tokio::test]
    async fn test_dry_run_skips_transport_and_validation() {
        let transport = Arc::new(Scripted::new(vec![]));
        let mut options = ExecutorOptions::default();
        options.dry_run = true;
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            options,
        );

        let results = run(
            &runner,
            &flow(vec![step(2, Method::Get, "http://api/x", "200")]),
        )
        .await;
        assert_eq!(results[0].outcome, StepOutcome::DryRun);
        assert!(results[0].command.starts_with("curl -v"));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_flow_by_default() {
        let transport = Arc::new(Scripted::new(vec![
            http(500, ""),
            http(204, ""),
        ]));
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(
            &runner,
            &flow(vec![
                step(2, Method::Get, "http://api/x", "200"),
                step(3, Method::Delete, "http://api/x", "204"),
            ]),
        )
        .await;
        assert_eq!(results.len(), 2, "teardown step must still run");
        assert_eq!(results[0].outcome, StepOutcome::Fail);
        assert_eq!(results[1].outcome, StepOutcome::Pass);
    }

    #[tokio::test]
    async fn test_stop_on_failure_aborts_flow() {
        let config: Arc<EngineConfig> = Arc::new(
            serde_json::from_value(json!({
                "nf_name": "smf",
                "stop_on_failure": true,
                "hosts": [{"name": "nrf-1"}]
            }))
            .unwrap(),
        );
        let transport = Arc::new(Scripted::new(vec![http(500, "")]));
        let runner = runner(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(
            &runner,
            &flow(vec![
                step(2, Method::Get, "http://api/x", "200"),
                step(3, Method::Get, "http://api/y", "200"),
            ]),
        )
        .await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_a_failed_step_not_a_crash() {
        let transport = Arc::new(Scripted::new(vec![])); // exhausted -> error
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            ExecutorOptions::default(),
        );

        let results = run(
            &runner,
            &flow(vec![step(2, Method::Get, "http://api/x", "200")]),
        )
        .await;
        assert_eq!(results[0].outcome, StepOutcome::Fail);
        assert_eq!(results[0].failure_kind.as_deref(), Some("TransportError"));
    }

    #[tokio::test]
    async fn test_mock_mode_tags_requests() {
        let transport = Arc::new(Scripted::new(vec![http(200, "{}")]));
        let mut options = ExecutorOptions::default();
        options.mock_mode = true;
        let runner = runner(
            config("smf"),
            Arc::clone(&transport) as Arc<dyn Transport>,
            options,
        );

        run(
            &runner,
            &flow(vec![step(2, Method::Get, "http://api/x", "200")]),
        )
        .await;
        let command = &transport.commands()[0];
        assert!(command.contains("X-Test-Sheet: smoke"));
        assert!(command.contains("X-Test-Name: nrf_register_read_delete"));
    }

    #[test]
    fn test_target_name_from_selector() {
        assert_eq!(target_name("token"), "token");
        assert_eq!(target_name("$.data.token"), "token");
        assert_eq!(target_name("items[0]"), "0");
        assert_eq!(target_name("$.a.b.c"), "c");
    }
}
