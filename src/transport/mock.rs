// Mock-server transport: instead of shelling out, the built curl command
// is parsed back into a request, its authority is rewritten to the mock
// server, and the answer is rendered as a synthetic curl -v trace so the
// response parser stays uniform. The mock server itself is an external
// collaborator; this side only reroutes.

use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;

use crate::config::Host;
use crate::errors::TransportError;

use super::{CommandOutput, Transport};

static AUTHORITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^/]+").expect("valid authority regex"));

/// The request recovered from a built command string.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCurl {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Splits a command the way `sh` would, honoring single quotes and the
/// `'\''` escape the builder emits.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_quotes = false;
    let mut pending = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            '\\' if !in_quotes => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                    pending = true;
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Recovers method/url/headers/body from a curl invocation, ignoring any
/// kubectl/oc exec prefix.
pub fn parse_curl(command: &str) -> Result<ParsedCurl, TransportError> {
    let tokens = tokenize(command);
    let start = tokens
        .iter()
        .position(|t| t == "curl")
        .ok_or_else(|| TransportError::Mock("command does not invoke curl".to_string()))?;

    let mut method = "GET".to_string();
    let mut url = None;
    let mut headers = Vec::new();
    let mut body = None;

    let mut i = start + 1;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "-X" | "--request" => {
                if let Some(value) = tokens.get(i + 1) {
                    method = value.clone();
                    i += 1;
                }
            }
            "-H" | "--header" => {
                if let Some(value) = tokens.get(i + 1) {
                    if let Some((name, v)) = value.split_once(':') {
                        headers.push((name.trim().to_string(), v.trim().to_string()));
                    }
                    i += 1;
                }
            }
            "-d" | "--data" | "--data-raw" => {
                if let Some(value) = tokens.get(i + 1) {
                    body = Some(value.clone());
                    i += 1;
                }
            }
            "-v" | "--http2-prior-knowledge" | "-s" | "-k" | "--insecure" => {}
            token if !token.starts_with('-') => {
                url = Some(token.to_string());
            }
            _ => {}
        }
        i += 1;
    }

    let url = url.ok_or_else(|| TransportError::Mock("no url in curl command".to_string()))?;
    Ok(ParsedCurl {
        method,
        url,
        headers,
        body,
    })
}

/// Swaps the scheme://authority part of the url for the mock server's.
pub fn reroute(url: &str, mock_base: &str) -> String {
    let base = mock_base.trim_end_matches('/');
    if AUTHORITY_RE.is_match(url) {
        AUTHORITY_RE.replace(url, base).into_owned()
    } else {
        format!("{}/{}", base, url.trim_start_matches('/'))
    }
}

pub struct MockTransport {
    client: Client,
    base_url: String,
}

impl MockTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, command: &str, host: &Host) -> Result<CommandOutput, TransportError> {
        let parsed = parse_curl(command)?;
        let url = reroute(&parsed.url, &self.base_url);
        tracing::debug!(host = %host.name, %url, method = %parsed.method, "mock exec");

        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|e| TransportError::Mock(format!("bad method: {}", e)))?;

        let started = Instant::now();
        let mut request = self.client.request(method, url.as_str());
        for (name, value) in &parsed.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &parsed.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Mock(format!("mock server unreachable: {}", e)))?;

        // Render the answer as the curl -v trace the parser expects.
        let status = response.status();
        let mut stderr = format!(
            "< HTTP/1.1 {} {}\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                stderr.push_str(&format!("< {}: {}\n", name, value));
            }
        }
        let stdout = response
            .text()
            .await
            .map_err(|e| TransportError::Mock(format!("mock body read failed: {}", e)))?;

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: 0,
            duration: started.elapsed(),
        })
    }
}
