// Module: Response
// Reconstructs an HTTP response from a curl -v invocation. The verbose
// trace on stderr carries the status line(s) and response headers
// (prefixed "< "); stdout is the body, byte-for-byte.

use std::time::Duration;

use serde_json::Value;

/// Case-insensitive response-header multimap.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for the header, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A reconstructed HTTP response plus the raw transport output it came
/// from. `log_text` is attached later when pod log capture is enabled.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body_text: String,
    pub body_json: Option<Value>,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub duration_ms: u64,
    pub log_text: Option<String>,
}

/// kubectl exec artifacts that must not be mistaken for body or trace
/// content.
const TTY_WARNINGS: &[&str] = &[
    "Unable to use a TTY",
    "Defaulted container",
];

fn strip_artifacts(text: &str) -> String {
    if !TTY_WARNINGS.iter().any(|w| text.contains(w)) {
        return text.to_string();
    }
    let mut kept: Vec<&str> = Vec::new();
    for line in text.lines() {
        if TTY_WARNINGS.iter().any(|w| line.contains(w)) {
            continue;
        }
        kept.push(line);
    }
    let mut out = kept.join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Parses the captured output of one curl -v invocation.
///
/// The last `< HTTP/` line on stderr determines the status (0 when the
/// trace carries none, e.g. connection refused); every `< name: value`
/// line becomes a response header.
pub fn parse(stdout: &str, stderr: &str, duration: Duration) -> HttpResponse {
    let clean_stderr = strip_artifacts(stderr);
    let body_text = strip_artifacts(stdout);

    let mut status_code: u16 = 0;
    let mut headers = Headers::default();

    for line in clean_stderr.lines() {
        let Some(rest) = line.strip_prefix("< ") else {
            continue;
        };
        if rest.starts_with("HTTP/") {
            // "< HTTP/2 201" or "< HTTP/1.1 200 OK": the token after the
            // version is the status code.
            if let Some(code) = rest
                .split_whitespace()
                .nth(1)
                .and_then(|t| t.parse::<u16>().ok())
            {
                status_code = code;
            }
            continue;
        }
        if let Some((name, value)) = rest.split_once(':') {
            let name = name.trim();
            if !name.is_empty() {
                headers.push(name, value.trim());
            }
        }
    }

    let body_json = serde_json::from_str(&body_text).ok();

    HttpResponse {
        status_code,
        headers,
        body_text,
        body_json,
        raw_stdout: stdout.to_string(),
        raw_stderr: stderr.to_string(),
        duration_ms: duration.as_millis() as u64,
        log_text: None,
    }
}
