// Module: Logging
// tracing initialization: a console layer plus (unless disabled) a
// non-blocking file layer writing <log-dir>/testpilot_<ts>.log. The
// structured failure logs are plain writers owned by the report module;
// this module only decides their paths.

use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// CLI --log-level; falls back to TESTPILOT_LOG_LEVEL, then INFO.
    pub level: Option<String>,
    /// CLI --log-dir; falls back to TESTPILOT_LOG_DIR, then "logs".
    pub log_dir: Option<PathBuf>,
    pub file_logging: bool,
}

/// Keeps the non-blocking writer alive and carries the derived paths.
pub struct LogHandles {
    pub main_log: Option<PathBuf>,
    pub failure_log: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

/// Maps the CLI's log level vocabulary onto tracing directives.
pub fn level_directive(level: &str) -> &'static str {
    match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" | "WARN" => "warn",
        "ERROR" => "error",
        "CRITICAL" => "error",
        _ => "info",
    }
}

pub fn resolve_level(options: &LoggingOptions) -> String {
    options
        .level
        .clone()
        .or_else(|| std::env::var("TESTPILOT_LOG_LEVEL").ok())
        .unwrap_or_else(|| "INFO".to_string())
}

pub fn resolve_dir(options: &LoggingOptions) -> PathBuf {
    options
        .log_dir
        .clone()
        .or_else(|| std::env::var("TESTPILOT_LOG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Installs the global subscriber. `ts` stamps the log file names so one
/// run's files sort together.
pub fn init(options: &LoggingOptions, ts: &str) -> anyhow::Result<LogHandles> {
    let directive = level_directive(&resolve_level(options));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    if !options.file_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .context("failed to install tracing subscriber")?;
        return Ok(LogHandles {
            main_log: None,
            failure_log: None,
            _guard: None,
        });
    }

    let dir = resolve_dir(options);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory '{}'", dir.display()))?;

    let main_log = dir.join(format!("testpilot_{}.log", ts));
    let failure_log = dir.join(format!("testpilot_failures_{}.log", ts));

    let appender = tracing_appender::rolling::never(&dir, format!("testpilot_{}.log", ts));
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LogHandles {
        main_log: Some(main_log),
        failure_log: Some(failure_log),
        _guard: Some(guard),
    })
}
