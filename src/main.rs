//! # TestPilot - Workflow-Aware Test Orchestration
//!
//! This is the **entry point** of TestPilot, an execution engine for
//! validating HTTP/REST services and Kubernetes-hosted 5G network
//! functions from spreadsheet-authored test suites.
//!
//! ## What this file does
//!
//! 1. **Parses the command line** (CLI) with the `clap` library
//! 2. **Initializes logging** (console plus rolling log files)
//! 3. **Loads and validates** the host configuration and the test suite
//! 4. **Wires the engine together**: transport, rate limiter, NRF
//!    tracker, flow runner, optional audit adapter
//! 5. **Runs the orchestrator** over every (flow, host) pair
//! 6. **Writes the reports** and maps the outcome to an exit code
//!    (0 all passed, 1 failures, 2 config error, 3 input error)
//!
//! ## Example usage
//!
//! ```bash
//! # Lenient (OTP) run of one sheet against the configured hosts
//! testpilot run -i suite.json -c hosts.json -s smoke
//!
//! # Strict audit run with an audit trail
//! testpilot run -i suite.json -m audit
//!
//! # Show the commands without executing anything
//! testpilot run -i suite.json --dry-run
//!
//! # Reroute every request to a recorded-response mock server
//! testpilot run -i suite.json --execution-mode mock \
//!     --mock-server-url http://127.0.0.1:9000
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           main.rs                               │
//! │  (CLI, wiring, reports, exit codes)                             │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │
//!                                 ▼
//!                        ┌────────────────┐
//!                        │ orchestrator/  │  flows × hosts fan-out
//!                        └───────┬────────┘
//!                                │ one worker per host
//!                                ▼
//!                        ┌────────────────┐
//!                        │   executor/    │  steps of one flow, in order
//!                        └───────┬────────┘
//!          ┌─────────────┬───────┴────────┬──────────────┐
//!          ▼             ▼                ▼              ▼
//!    ┌──────────┐  ┌──────────┐    ┌───────────┐  ┌────────────┐
//!    │ command/ │  │ limiter/ │    │ transport/│  │ validation/│
//!    │ (curl,   │  │ (token   │    │ (local,   │  │ (status,   │
//!    │  kubectl,│  │  bucket) │    │  ssh,     │  │  pattern,  │
//!    │  NRF url)│  │          │    │  mock)    │  │  payload)  │
//!    └──────────┘  └──────────┘    └───────────┘  └────────────┘
//! ```
//!
//! The NRF instance tracker (`nrf/`) sits behind the command builder and
//! rewrites instance URLs across PUT/GET/PATCH/DELETE sequences; the
//! response parser (`response/`) reconstructs status, headers and body
//! from the curl verbose trace every command carries.

mod audit;
mod command;
mod config;
mod context;
mod errors;
mod executor;
mod limiter;
mod logging;
mod nrf;
mod orchestrator;
mod pattern;
mod report;
mod response;
mod suite;
mod transport;
mod validation;

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use uuid::Uuid;

use audit::{AuditRunner, AuditTrail};
use config::EngineConfig;
use executor::{ExecutorOptions, FlowRunner};
use limiter::RateGate;
use logging::LoggingOptions;
use nrf::InstanceTracker;
use orchestrator::{FlowDriver, Orchestrator};
use report::{FailureLog, ResultSink, RunReport, RunSummary, TestResult};
use suite::Suite;
use transport::local::LocalTransport;
use transport::mock::MockTransport;
use transport::ssh::SshTransport;
use transport::Transport;
use validation::Strictness;

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_INPUT_ERROR: i32 = 3;

#[derive(Parser)]
#[command(
    name = "testpilot",
    about = "Workflow-aware test orchestration for HTTP services and 5G network functions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test suite against the configured hosts.
    Run(RunArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    /// Lenient validation (default).
    Otp,
    /// Strict validation with an audit trail.
    Audit,
    /// Validate the configuration and exit.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExecutionMode {
    Production,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DisplayMode {
    /// One line per step.
    Full,
    /// Failures plus a final summary.
    Progress,
    /// Summary only.
    Simple,
}

#[derive(Args)]
struct RunArgs {
    /// Suite file: the parsed-workbook interchange JSON.
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Host/engine configuration file.
    #[arg(short = 'c', long, default_value = "hosts.json")]
    config: PathBuf,

    #[arg(short = 'm', long, value_enum, default_value_t = RunMode::Otp)]
    mode: RunMode,

    /// Restrict to these sheets (comma-separated).
    #[arg(short = 's', long, value_delimiter = ',')]
    sheets: Vec<String>,

    /// Restrict to one test name.
    #[arg(short = 't', long)]
    test_name: Option<String>,

    /// Build and display commands without executing them.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, value_enum, default_value_t = ExecutionMode::Production)]
    execution_mode: ExecutionMode,

    /// Base URL of the running mock server (mock mode).
    #[arg(long)]
    mock_server_url: Option<String>,

    /// Requests-per-second override for every host.
    #[arg(long)]
    rate_limit: Option<f64>,

    /// Pause between steps, seconds.
    #[arg(long)]
    step_delay: Option<f64>,

    /// DEBUG | INFO | WARNING | ERROR | CRITICAL.
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    no_file_logging: bool,

    #[arg(long, value_enum, default_value_t = DisplayMode::Progress)]
    display_mode: DisplayMode,

    /// Abort a flow at its first failing step.
    #[arg(long)]
    stop_on_failure: bool,

    /// Pod-mode placeholder resources map.
    #[arg(long, default_value = "resources_map.json")]
    resources_map: PathBuf,

    #[arg(long, default_value = "test_results")]
    results_dir: PathBuf,
}

/// Console + failure-log sink. The executor pushes every TestResult here
/// as it happens.
struct RunSink {
    display: DisplayMode,
    structured: Option<FailureLog>,
    failures: Option<Mutex<std::fs::File>>,
}

impl ResultSink for RunSink {
    fn on_result(&self, result: &TestResult) {
        match self.display {
            DisplayMode::Full => println!(
                "[{}][{}][row {}][{}] {} {}",
                result.outcome,
                result.sheet,
                result.row_idx,
                result.host,
                result.method,
                result.test_name
            ),
            DisplayMode::Progress | DisplayMode::Simple => {
                if let Some(line) = result.console_line() {
                    println!("{}", line);
                }
            }
        }
        if result.is_failure() {
            if let Some(log) = &self.structured {
                log.record(result);
            }
            if let (Some(file), Some(line)) = (&self.failures, result.console_line()) {
                let mut file = file.lock().expect("failure file poisoned");
                let _ = writeln!(file, "{} {}", result.timestamp.to_rfc3339(), line);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run(args).await,
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    let started = Utc::now();
    let ts = started.format("%Y%m%d_%H%M%S").to_string();

    let logging_options = LoggingOptions {
        level: args.log_level.clone(),
        log_dir: args.log_dir.clone(),
        file_logging: !args.no_file_logging,
    };
    let handles = match logging::init(&logging_options, &ts) {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("failed to initialize logging: {:#}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let mut engine_config = match EngineConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return EXIT_CONFIG_ERROR;
        }
    };
    if args.stop_on_failure {
        engine_config.stop_on_failure = true;
    }

    if args.mode == RunMode::Config {
        let hosts = engine_config
            .hosts
            .iter()
            .map(|h| h.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "configuration valid: nf_name={}, use_ssh={}, pod_mode={}, hosts=[{}]",
            engine_config.nf_name(),
            engine_config.use_ssh,
            engine_config.pod_mode,
            hosts
        );
        return EXIT_OK;
    }

    let suite = match Suite::load(&args.input)
        .and_then(|s| s.select(&args.sheets, args.test_name.as_deref()))
    {
        Ok(suite) => suite,
        Err(e) => {
            error!(error = %e, "input error");
            return EXIT_INPUT_ERROR;
        }
    };
    if let Err(e) = suite.verify_reference_files(&engine_config.payloads_dir) {
        error!(error = %e, "configuration error");
        return EXIT_CONFIG_ERROR;
    }
    info!(
        flows = suite.flows.len(),
        steps = suite.flows.iter().map(|f| f.steps.len()).sum::<usize>(),
        "suite loaded"
    );

    let transport: Arc<dyn Transport> = match args.execution_mode {
        ExecutionMode::Mock => {
            let Some(url) = args.mock_server_url.clone() else {
                error!("--execution-mode mock requires --mock-server-url");
                return EXIT_CONFIG_ERROR;
            };
            Arc::new(MockTransport::new(url))
        }
        ExecutionMode::Production => {
            if engine_config.use_ssh && !engine_config.pod_mode {
                Arc::new(SshTransport::new(engine_config.ssh_settings.clone()))
            } else {
                Arc::new(LocalTransport::new(Duration::from_secs(
                    engine_config.ssh_settings.timeout,
                )))
            }
        }
    };

    let resources = if engine_config.pod_mode {
        match config::load_resources_map(&args.resources_map) {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "resources map unavailable; placeholders limited to saved values");
                Default::default()
            }
        }
    } else {
        Default::default()
    };

    let engine_config = Arc::new(engine_config);
    let limiter = Arc::new(RateGate::new(&engine_config.rate_limiting, args.rate_limit));
    let tracker = Arc::new(InstanceTracker::new(
        engine_config.nrf_cleanup_overrides.clone(),
    ));

    let strictness = match args.mode {
        RunMode::Audit => Strictness::Strict,
        _ => Strictness::Lenient,
    };
    let options = ExecutorOptions {
        strictness,
        dry_run: args.dry_run,
        step_delay: Duration::from_secs_f64(args.step_delay.unwrap_or(0.0)),
        mock_mode: args.execution_mode == ExecutionMode::Mock,
    };
    let runner = FlowRunner::new(
        Arc::clone(&engine_config),
        transport,
        limiter,
        Arc::clone(&tracker),
        options,
        resources,
    );

    let audit_trail = (args.mode == RunMode::Audit).then(|| Arc::new(AuditTrail::default()));
    let driver: Arc<dyn FlowDriver> = match &audit_trail {
        Some(trail) => Arc::new(AuditRunner::new(
            runner,
            Arc::clone(&engine_config),
            Arc::clone(trail),
        )),
        None => Arc::new(runner),
    };

    let orchestrator = Orchestrator::new(Arc::clone(&engine_config), driver);

    // First interrupt finishes in-flight steps; a second one force-stops
    // after the grace window.
    let soft = orchestrator.soft_cancel_token();
    let hard = orchestrator.hard_cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt: finishing in-flight steps (press again to force-stop)");
            soft.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                hard.cancel();
            }
        }
    });

    let structured = handles
        .failure_log
        .as_deref()
        .map(|path| path.with_file_name(format!("testpilot_failures_structured_{}.log", ts)))
        .and_then(|path| FailureLog::create(&path).ok());
    let failures = handles
        .failure_log
        .as_deref()
        .and_then(|path| std::fs::File::create(path).ok())
        .map(Mutex::new);
    let sink = Arc::new(RunSink {
        display: args.display_mode,
        structured,
        failures,
    });

    let results = orchestrator.run(suite.flows, sink).await;
    let finished = Utc::now();
    let duration_ms = (finished - started).num_milliseconds().max(0) as u64;
    let summary = RunSummary::from_results(&results, duration_ms);

    println!(
        "steps: {} | passed: {} | failed: {} | skipped: {} | dry-run: {} | {} ms",
        summary.total_steps,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.dry_run,
        summary.duration_ms
    );

    let run_report = RunReport {
        run_id: Uuid::new_v4().to_string(),
        mode: format!("{:?}", args.mode).to_lowercase(),
        started,
        finished,
        summary: RunSummary::from_results(&results, duration_ms),
        results,
    };
    match run_report.write_json(&args.results_dir) {
        Ok(path) => info!(path = %path.display(), "results written"),
        Err(e) => warn!(error = %e, "failed to write results file"),
    }
    if let Some(trail) = &audit_trail {
        match trail.write_json(&args.results_dir, started) {
            Ok(path) => info!(path = %path.display(), "audit trail written"),
            Err(e) => warn!(error = %e, "failed to write audit trail"),
        }
    }

    if summary.all_passed() {
        EXIT_OK
    } else {
        EXIT_FAILED
    }
}
