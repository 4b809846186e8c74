// Module: Config
// Host registry and engine settings. A JSON document in which every string
// value may reference the process environment as ${VAR} (required) or
// ${VAR:-default} (optional with fallback).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::ConfigError;
use crate::nrf::CleanupPolicy;

static ENV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env expansion regex")
});

/// Expands `${VAR}` and `${VAR:-default}` references in a single string.
/// The required form fails when the variable is unset; the defaulted form
/// falls back.
pub fn expand_env(input: &str) -> Result<String, ConfigError> {
    let mut result = String::new();
    let mut last_index = 0;

    for capture in ENV_RE.captures_iter(input) {
        let matched = capture.get(0).unwrap();
        result.push_str(&input[last_index..matched.start()]);
        let name = capture.get(1).unwrap().as_str();
        match std::env::var(name) {
            Ok(value) => result.push_str(&value),
            Err(_) => match capture.get(2) {
                Some(default) => result.push_str(default.as_str()),
                None => {
                    return Err(ConfigError::MissingEnvVar {
                        name: name.to_string(),
                    })
                }
            },
        }
        last_index = matched.end();
    }

    result.push_str(&input[last_index..]);
    Ok(result)
}

/// Walks a JSON tree and expands environment references in every string.
fn expand_value(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = expand_env(s)?;
        }
        Value::Array(items) => {
            for item in items {
                expand_value(item)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_value(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Kubernetes CLI flavor available on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KubeCli {
    Kubectl,
    Oc,
}

impl KubeCli {
    pub fn binary(&self) -> &'static str {
        match self {
            KubeCli::Kubectl => "kubectl",
            KubeCli::Oc => "oc",
        }
    }
}

/// One target host. With `use_ssh`, exactly one of `password`/`key_path`
/// must be set; `cli` may be pre-configured or probed at first use.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub cli: Option<KubeCli>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Host {
    /// Namespace for kubectl wrapping: host entry first, then the
    /// pod-mode environment fallbacks.
    pub fn namespace(&self) -> Option<String> {
        self.namespace.clone().or_else(detect_namespace)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub default_reqs_per_sec: Option<f64>,
    #[serde(default = "default_true")]
    pub per_host: bool,
    /// Bucket capacity; defaults to the rounded rate when unset.
    #[serde(default)]
    pub burst_size: Option<u32>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_reqs_per_sec: None,
            per_host: true,
            burst_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshSettings {
    #[serde(default = "default_true")]
    pub auto_add_hosts: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between connection attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Per-command transport timeout, seconds.
    #[serde(default = "default_ssh_timeout")]
    pub timeout: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_ssh_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            auto_add_hosts: true,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_ssh_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubectlLogsSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Capture window, seconds. Bounded at run time by the remaining
    /// step timeout.
    #[serde(default = "default_capture_duration")]
    pub capture_duration: u64,
    /// Passed to `kubectl logs --since=`.
    #[serde(default = "default_since_duration")]
    pub since_duration: String,
}

fn default_capture_duration() -> u64 {
    10
}
fn default_since_duration() -> String {
    "10s".to_string()
}

impl Default for KubectlLogsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_duration: default_capture_duration(),
            since_duration: default_since_duration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationSettings {
    /// Lenient-mode pass threshold for structural matches, percent.
    #[serde(default = "default_match_threshold")]
    pub json_match_threshold: f64,
    /// Dotted paths removed from both sides before payload comparison.
    #[serde(default)]
    pub ignore_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub ignore_array_order: bool,
}

fn default_match_threshold() -> f64 {
    50.0
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            json_match_threshold: default_match_threshold(),
            ignore_fields: Vec::new(),
            ignore_array_order: true,
        }
    }
}

/// `connect_to`: either the literal `"all"` / a single host name, or a
/// list of host names.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostSelection {
    Name(String),
    Names(Vec<String>),
}

impl Default for HostSelection {
    fn default() -> Self {
        HostSelection::Name("all".to_string())
    }
}

/// Top-level engine configuration. Immutable after load; shared behind Arc.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub use_ssh: bool,
    /// Running inside the target pod: commands execute locally, no SSH,
    /// no kubectl wrapping.
    #[serde(default)]
    pub pod_mode: bool,
    #[serde(default)]
    pub nf_name: String,
    #[serde(default)]
    pub connect_to: HostSelection,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
    #[serde(default)]
    pub ssh_settings: SshSettings,
    #[serde(default)]
    pub kubectl_logs_settings: KubectlLogsSettings,
    #[serde(default)]
    pub validation_settings: ValidationSettings,
    #[serde(default = "default_payloads_dir")]
    pub payloads_dir: PathBuf,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub http2_prior_knowledge: bool,
    /// Overall per-step budget (command, log capture, validation), seconds.
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,
    /// Test-name substring -> cleanup policy, overriding the built-in
    /// registration/discovery heuristics.
    #[serde(default)]
    pub nrf_cleanup_overrides: HashMap<String, CleanupPolicy>,
}

fn default_payloads_dir() -> PathBuf {
    PathBuf::from("payloads")
}

fn default_step_timeout() -> u64 {
    60
}

impl EngineConfig {
    /// Loads, expands environment references, applies env overrides and
    /// validates host entries.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut raw: Value =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        expand_value(&mut raw)?;
        let mut config: EngineConfig =
            serde_json::from_value(raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Ok(v) = std::env::var("TESTPILOT_SSH_TIMEOUT") {
            if let Ok(n) = v.parse() {
                config.ssh_settings.timeout = n;
            }
        }
        if let Ok(v) = std::env::var("TESTPILOT_SSH_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.ssh_settings.max_retries = n;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Lower-cased network-function identity.
    pub fn nf_name(&self) -> String {
        self.nf_name.to_lowercase()
    }

    /// NRF instance tracking is active only for the NRF identities.
    pub fn nrf_tracking_enabled(&self) -> bool {
        matches!(self.nf_name().as_str(), "nrf" | "ocnrf")
    }

    /// Hosts targeted by this run, resolved from `connect_to`.
    pub fn selected_hosts(&self) -> Result<Vec<&Host>, ConfigError> {
        let names: Vec<String> = match &self.connect_to {
            HostSelection::Name(name) if name.eq_ignore_ascii_case("all") => {
                return Ok(self.hosts.iter().collect());
            }
            HostSelection::Name(name) => vec![name.clone()],
            HostSelection::Names(names) => names.clone(),
        };

        let mut selected = Vec::with_capacity(names.len());
        for name in &names {
            let host = self
                .hosts
                .iter()
                .find(|h| &h.name == name)
                .ok_or_else(|| ConfigError::UnknownHost { name: name.clone() })?;
            selected.push(host);
        }
        Ok(selected)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.use_ssh || self.pod_mode {
            return Ok(());
        }
        for host in &self.hosts {
            match (&host.password, &host.key_path) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::ConflictingAuth {
                        host: host.name.clone(),
                    })
                }
                (None, None) => {
                    return Err(ConfigError::MissingAuth {
                        host: host.name.clone(),
                    })
                }
                (None, Some(key_path)) => {
                    if !key_path.exists() {
                        warn!(
                            host = %host.name,
                            key_path = %key_path.display(),
                            "ssh key file not found; connection will likely fail"
                        );
                    }
                }
                (Some(_), None) => {}
            }
        }
        Ok(())
    }
}

/// Pod-mode resources map: flat `{placeholder -> value}` document used to
/// expand `{name}` tokens in URLs and commands. Loaded once.
pub fn load_resources_map<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut raw: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    expand_value(&mut raw)?;
    let map: HashMap<String, String> =
        serde_json::from_value(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(map)
}

/// Pod-mode namespace detection order.
pub fn detect_namespace() -> Option<String> {
    for var in ["TESTPILOT_NAMESPACE", "POD_NAMESPACE", "NAMESPACE"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}
