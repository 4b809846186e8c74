// Module: Errors
// Typed error taxonomy shared across the engine, plus the per-step
// failure categories that end up in TestResult.fail_reason.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating the engine configuration.
/// These abort the run before any flow starts (exit code 2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file '{path}' is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `${VAR}` referenced an unset environment variable and carried
    /// no `:-default` fallback.
    #[error("environment variable '{name}' is not set (referenced as ${{{name}}})")]
    MissingEnvVar { name: String },

    #[error("host '{host}': both 'password' and 'key_path' are set; pick one")]
    ConflictingAuth { host: String },

    #[error("host '{host}': use_ssh is enabled but neither 'password' nor 'key_path' is set")]
    MissingAuth { host: String },

    #[error("connect_to references unknown host '{name}'")]
    UnknownHost { name: String },

    /// A step references a response payload file that does not exist.
    /// Detected at suite load so it cannot degrade into a silent pass.
    #[error("reference payload file '{path}' not found (sheet '{sheet}', row {row})")]
    MissingReferenceFile {
        path: PathBuf,
        sheet: String,
        row: usize,
    },
}

/// Errors raised while loading the test suite. These also abort the run
/// before execution (exit code 3).
#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read suite file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("suite file '{path}' is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sheet '{sheet}', row {row}: unknown HTTP method '{method}'")]
    UnknownMethod {
        sheet: String,
        row: usize,
        method: String,
    },

    #[error("sheet '{sheet}', row {row}: missing required column '{column}'")]
    MissingColumn {
        sheet: String,
        row: usize,
        column: String,
    },

    #[error("no flows matched the sheet/test selection")]
    EmptySelection,
}

/// Errors raised while assembling the wire command for one step.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("payload file '{path}' not found under the payloads directory")]
    PayloadFileMissing { path: PathBuf },

    #[error("placeholder '{{{name}}}' has no binding in the flow context")]
    UnresolvedPlaceholder { name: String },

    #[error("payload is not valid JSON and NRF tracking requires an nfInstanceId: {0}")]
    UnparseablePayload(String),
}

/// Errors raised by the transport layer. A command that ran but exited
/// non-zero is NOT a transport error; curl reports HTTP failures through
/// the status line, which the response parser recovers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn local command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ssh connection to {host}:{port} failed after {attempts} attempt(s): {reason}")]
    Connect {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    #[error("ssh authentication failed for {user}@{host}")]
    Auth { user: String, host: String },

    #[error("ssh session error: {0}")]
    Session(String),

    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("mock transport error: {0}")]
    Mock(String),
}

/// Per-step failure category. Recorded in TestResult and the structured
/// failure log; the exact set the reporting pipeline groups by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    StatusMismatch,
    PatternMismatch,
    PayloadMismatch,
    MissingSavedValue,
    ComparisonMismatch,
    Build,
    Transport,
    /// Informational: DELETE with no active NRF instance. The step is
    /// skipped, never failed, and no HTTP request is issued.
    NrfNoActiveInstance,
    /// Strict-mode override of a step that passed lenient validation.
    AuditStrictFail,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::StatusMismatch => "StatusMismatch",
            FailureKind::PatternMismatch => "PatternMismatch",
            FailureKind::PayloadMismatch => "PayloadMismatch",
            FailureKind::MissingSavedValue => "MissingSavedValue",
            FailureKind::ComparisonMismatch => "ComparisonMismatch",
            FailureKind::Build => "BuildError",
            FailureKind::Transport => "TransportError",
            FailureKind::NrfNoActiveInstance => "NRFNoActiveInstance",
            FailureKind::AuditStrictFail => "AuditStrictFail",
            FailureKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_display_matches_log_vocabulary() {
        assert_eq!(FailureKind::StatusMismatch.to_string(), "StatusMismatch");
        assert_eq!(
            FailureKind::NrfNoActiveInstance.to_string(),
            "NRFNoActiveInstance"
        );
        assert_eq!(FailureKind::AuditStrictFail.to_string(), "AuditStrictFail");
    }

    #[test]
    fn test_config_error_messages_name_the_host() {
        let err = ConfigError::ConflictingAuth {
            host: "nrf-1".to_string(),
        };
        assert!(err.to_string().contains("nrf-1"));

        let err = ConfigError::MissingEnvVar {
            name: "NRF_PASSWORD".to_string(),
        };
        assert!(err.to_string().contains("${NRF_PASSWORD}"));
    }

    #[test]
    fn test_build_error_names_the_placeholder() {
        let err = BuildError::UnresolvedPlaceholder {
            name: "token".to_string(),
        };
        assert!(err.to_string().contains("{token}"));
    }
}
