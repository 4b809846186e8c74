// Module: Command
// Builds the wire-level command for one step: payload resolution, NRF URL
// rewriting, curl assembly (verbose is always on; the response parser
// needs the trace) and kubectl/oc exec wrapping. SSH invocation is the
// transport's concern.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::config::{EngineConfig, Host, KubeCli};
use crate::context::FlowContext;
use crate::errors::BuildError;
use crate::nrf::{InstanceTracker, TrackContext};
use crate::suite::{is_inline_payload, Method, TestStep};

/// The product of building one step. `Skip` means the step must not reach
/// the transport (NRF DELETE with no active instance).
#[derive(Debug, Clone)]
pub enum BuiltCommand {
    Execute {
        command: String,
        url: String,
        /// Resolved request payload, inline form.
        payload: Option<String>,
    },
    Skip {
        reason: String,
    },
}

pub struct CommandBuilder {
    config: Arc<EngineConfig>,
    tracker: Arc<InstanceTracker>,
}

/// Single-quote shell escaping; the command runs through `sh -c`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Pulls the nfInstanceId out of a PUT payload: top-level object, or the
/// first object in a list.
fn extract_nf_instance_id(payload: &Value) -> Option<String> {
    let object = match payload {
        Value::Object(_) => Some(payload),
        Value::Array(items) => items.iter().find(|v| v.is_object()),
        _ => None,
    }?;
    object
        .get("nfInstanceId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn append_to_url(url: &str, id: &str) -> String {
    format!(
        "{}/{}",
        url.trim_end_matches('/'),
        urlencoding::encode(id)
    )
}

impl CommandBuilder {
    pub fn new(config: Arc<EngineConfig>, tracker: Arc<InstanceTracker>) -> Self {
        Self { config, tracker }
    }

    /// Resolves the payload cell to inline content and interpolates
    /// placeholders into it.
    fn resolve_payload(
        &self,
        step: &TestStep,
        ctx: &FlowContext,
    ) -> Result<Option<String>, BuildError> {
        let Some(cell) = &step.payload else {
            return Ok(None);
        };
        let raw = if is_inline_payload(cell) {
            cell.clone()
        } else {
            let path = self.config.payloads_dir.join(cell.trim());
            std::fs::read_to_string(&path)
                .map_err(|_| BuildError::PayloadFileMissing { path })?
        };
        Ok(Some(ctx.interpolate(&raw)?))
    }

    /// NRF URL rewriting. Returns the rewritten URL, or None when the
    /// step must be skipped.
    fn rewrite_for_nrf(
        &self,
        step: &TestStep,
        track: &TrackContext,
        session: &str,
        url: String,
        payload: Option<&str>,
    ) -> Result<Option<String>, BuildError> {
        self.tracker.track_progression(session, track);

        match step.method {
            Method::Put => {
                let Some(body) = payload else {
                    warn!(row = step.row_idx, "NRF PUT without payload; url left unchanged");
                    return Ok(Some(url));
                };
                let parsed: Value = serde_json::from_str(body)
                    .map_err(|e| BuildError::UnparseablePayload(e.to_string()))?;
                match extract_nf_instance_id(&parsed) {
                    Some(id) => {
                        let rewritten = append_to_url(&url, &id);
                        self.tracker.on_put(session, track, &id);
                        Ok(Some(rewritten))
                    }
                    None => {
                        warn!(
                            row = step.row_idx,
                            "NRF PUT payload carries no nfInstanceId; url left unchanged"
                        );
                        Ok(Some(url))
                    }
                }
            }
            Method::Get | Method::Patch => {
                match self.tracker.select_for(session, track, step.method) {
                    Some(id) => Ok(Some(append_to_url(&url, &id))),
                    // No active instance: a collection-level GET/PATCH is
                    // still meaningful, so the url stays as authored.
                    None => Ok(Some(url)),
                }
            }
            Method::Delete => match self.tracker.on_delete(session, track) {
                Some(id) => Ok(Some(append_to_url(&url, &id))),
                None => Ok(None),
            },
            Method::Post => Ok(Some(url)),
        }
    }

    fn assemble_curl(
        &self,
        step: &TestStep,
        url: &str,
        headers: &[(String, String)],
        payload: Option<&str>,
    ) -> String {
        let mut command = String::from("curl -v");
        if self.config.http2_prior_knowledge {
            command.push_str(" --http2-prior-knowledge");
        }
        command.push_str(&format!(" -X {} {}", step.method, shell_quote(url)));
        for (name, value) in headers {
            command.push_str(&format!(" -H {}", shell_quote(&format!("{}: {}", name, value))));
        }
        if let Some(body) = payload {
            command.push_str(&format!(" -d {}", shell_quote(body)));
        }
        command
    }

    fn wrap_for_pod(
        &self,
        command: String,
        step: &TestStep,
        host: &Host,
        cli: Option<KubeCli>,
    ) -> String {
        if self.config.pod_mode {
            return command;
        }
        let (Some(pod), Some(cli)) = (&step.pod_exec, cli.or(host.cli)) else {
            return command;
        };
        let namespace = host.namespace().unwrap_or_else(|| "default".to_string());
        format!(
            "{} exec {} -n {} -- {}",
            cli.binary(),
            pod,
            namespace,
            command
        )
    }

    /// Builds the complete command for one step. `cli` is the probed
    /// kubectl/oc flavor for the host, when known.
    pub fn build(
        &self,
        step: &TestStep,
        track: &TrackContext,
        session: &str,
        host: &Host,
        cli: Option<KubeCli>,
        ctx: &FlowContext,
    ) -> Result<BuiltCommand, BuildError> {
        let payload = self.resolve_payload(step, ctx)?;
        let mut url = ctx.interpolate(&step.url)?;
        let headers: Vec<(String, String)> = step
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), ctx.interpolate(v)?)))
            .collect::<Result<_, BuildError>>()?;

        if self.config.nrf_tracking_enabled() {
            match self.rewrite_for_nrf(step, track, session, url, payload.as_deref())? {
                Some(rewritten) => url = rewritten,
                None => {
                    return Ok(BuiltCommand::Skip {
                        reason: "no active NRF instance for DELETE".to_string(),
                    })
                }
            }
        }

        let curl = self.assemble_curl(step, &url, &headers, payload.as_deref());
        let command = self.wrap_for_pod(curl, step, host, cli);

        Ok(BuiltCommand::Execute {
            command,
            url,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn config(nf_name: &str) -> Arc<EngineConfig> {
        Arc::new(
            serde_json::from_value(json!({
                "nf_name": nf_name,
                "hosts": [{"name": "nrf-1", "namespace": "core5g", "cli": "kubectl"}]
            }))
            .unwrap(),
        )
    }

    fn builder(nf_name: &str) -> (CommandBuilder, Arc<EngineConfig>) {
        let config = config(nf_name);
        let tracker = Arc::new(InstanceTracker::new(HashMap::new()));
        (CommandBuilder::new(Arc::clone(&config), tracker), config)
    }

    fn host(config: &EngineConfig) -> &Host {
        &config.hosts[0]
    }

    fn step(method: Method, url: &str) -> TestStep {
        TestStep {
            row_idx: 2,
            method,
            url: url.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            payload: None,
            expected_status: "200".to_string(),
            pattern_match: None,
            response_payload: None,
            pod_exec: None,
            save_as: None,
            compare_with: None,
            reqs_per_sec: None,
        }
    }

    fn track() -> TrackContext {
        TrackContext {
            sheet: "smoke".to_string(),
            test_name: "smf_flow".to_string(),
            row_idx: 2,
        }
    }

    fn command_of(built: BuiltCommand) -> String {
        match built {
            BuiltCommand::Execute { command, .. } => command,
            BuiltCommand::Skip { reason } => panic!("expected a command, got skip: {}", reason),
        }
    }

    #[test]
    fn test_curl_assembly_with_headers_and_payload() {
        let (builder, config) = builder("smf");
        let mut s = step(Method::Post, "http://smf:8080/items");
        s.payload = Some(r#"{"a": 1}"#.to_string());

        let built = builder
            .build(&s, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap();
        let command = command_of(built);

        assert!(command.starts_with("curl -v -X POST 'http://smf:8080/items'"));
        assert!(command.contains("-H 'Content-Type: application/json'"));
        assert!(command.contains(r#"-d '{"a": 1}'"#));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn test_get_without_payload_has_no_data_flag() {
        let (builder, config) = builder("smf");
        let s = step(Method::Get, "http://smf:8080/items");
        let command = command_of(
            builder
                .build(&s, &track(), "sess", host(&config), None, &FlowContext::new())
                .unwrap(),
        );
        assert!(!command.contains(" -d "));
    }

    #[test]
    fn test_http2_prior_knowledge_flag() {
        let config: Arc<EngineConfig> = Arc::new(
            serde_json::from_value(json!({
                "nf_name": "smf",
                "http2_prior_knowledge": true,
                "hosts": [{"name": "h"}]
            }))
            .unwrap(),
        );
        let tracker = Arc::new(InstanceTracker::new(HashMap::new()));
        let builder = CommandBuilder::new(Arc::clone(&config), tracker);
        let command = command_of(
            builder
                .build(
                    &step(Method::Get, "http://h/x"),
                    &track(),
                    "sess",
                    &config.hosts[0],
                    None,
                    &FlowContext::new(),
                )
                .unwrap(),
        );
        assert!(command.contains("curl -v --http2-prior-knowledge -X GET"));
    }

    #[test]
    fn test_placeholders_resolved_in_url_headers_payload() {
        let (builder, config) = builder("smf");
        let mut ctx = FlowContext::new();
        ctx.save("token", json!("T-1"));
        ctx.set_placeholder("base", "http://smf:8080");

        let mut s = step(Method::Post, "{base}/items");
        s.headers = vec![("Authorization".to_string(), "Bearer {token}".to_string())];
        s.payload = Some(r#"{"token": "{token}"}"#.to_string());

        let built = builder
            .build(&s, &track(), "sess", host(&config), None, &ctx)
            .unwrap();
        let BuiltCommand::Execute { command, url, payload } = built else {
            panic!("expected execute");
        };
        assert_eq!(url, "http://smf:8080/items");
        assert!(command.contains("-H 'Authorization: Bearer T-1'"));
        assert_eq!(payload.as_deref(), Some(r#"{"token": "T-1"}"#));
    }

    #[test]
    fn test_unresolved_placeholder_fails_the_build() {
        let (builder, config) = builder("smf");
        let s = step(Method::Get, "http://h/{missing}");
        let err = builder
            .build(&s, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedPlaceholder { name } if name == "missing"));
    }

    #[test]
    fn test_payload_file_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("register.json"), r#"{"nfType":"SMF"}"#).unwrap();

        let config: Arc<EngineConfig> = Arc::new(
            serde_json::from_value(json!({
                "nf_name": "smf",
                "payloads_dir": dir.path(),
                "hosts": [{"name": "h"}]
            }))
            .unwrap(),
        );
        let builder = CommandBuilder::new(
            Arc::clone(&config),
            Arc::new(InstanceTracker::new(HashMap::new())),
        );
        let mut s = step(Method::Put, "http://h/x");
        s.payload = Some("register.json".to_string());

        let BuiltCommand::Execute { payload, .. } = builder
            .build(&s, &track(), "sess", &config.hosts[0], None, &FlowContext::new())
            .unwrap()
        else {
            panic!("expected execute");
        };
        assert_eq!(payload.as_deref(), Some(r#"{"nfType":"SMF"}"#));

        s.payload = Some("absent.json".to_string());
        let err = builder
            .build(&s, &track(), "sess", &config.hosts[0], None, &FlowContext::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::PayloadFileMissing { .. }));
    }

    #[test]
    fn test_nrf_put_registers_and_appends_instance_id() {
        let (builder, config) = builder("NRF");
        let mut s = step(Method::Put, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        s.payload = Some(r#"{"nfInstanceId":"abc-123","nfType":"SMF"}"#.to_string());

        let BuiltCommand::Execute { url, .. } = builder
            .build(&s, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap()
        else {
            panic!("expected execute");
        };
        assert_eq!(url, "http://nrf:8081/nnrf-nfm/v1/nf-instances/abc-123");

        // Subsequent GET and DELETE target the registered id.
        let get = step(Method::Get, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        let BuiltCommand::Execute { url, .. } = builder
            .build(&get, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap()
        else {
            panic!("expected execute");
        };
        assert!(url.ends_with("/abc-123"));

        let delete = step(Method::Delete, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        let BuiltCommand::Execute { url, .. } = builder
            .build(&delete, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap()
        else {
            panic!("expected execute");
        };
        assert!(url.ends_with("/abc-123"));
    }

    #[test]
    fn test_nrf_double_delete_yields_skip_sentinel() {
        let (builder, config) = builder("nrf");
        let mut put = step(Method::Put, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        put.payload = Some(r#"{"nfInstanceId":"abc-123"}"#.to_string());
        let delete = step(Method::Delete, "http://nrf:8081/nnrf-nfm/v1/nf-instances/");
        let ctx = FlowContext::new();

        builder
            .build(&put, &track(), "sess", host(&config), None, &ctx)
            .unwrap();
        let first = builder
            .build(&delete, &track(), "sess", host(&config), None, &ctx)
            .unwrap();
        assert!(matches!(first, BuiltCommand::Execute { .. }));

        let second = builder
            .build(&delete, &track(), "sess", host(&config), None, &ctx)
            .unwrap();
        assert!(
            matches!(second, BuiltCommand::Skip { .. }),
            "double DELETE must not reach the transport"
        );
    }

    #[test]
    fn test_nrf_put_with_list_payload() {
        let payload = json!([{"nfInstanceId": "list-1"}, {"nfInstanceId": "list-2"}]);
        assert_eq!(extract_nf_instance_id(&payload), Some("list-1".to_string()));
        assert_eq!(extract_nf_instance_id(&json!({"other": 1})), None);
    }

    #[test]
    fn test_non_nrf_identity_skips_rewriting() {
        let (builder, config) = builder("smf");
        let get = step(Method::Get, "http://smf:8080/items/");
        let BuiltCommand::Execute { url, .. } = builder
            .build(&get, &track(), "sess", host(&config), None, &FlowContext::new())
            .unwrap()
        else {
            panic!("expected execute");
        };
        assert_eq!(url, "http://smf:8080/items/", "legacy path leaves urls alone");
    }

    #[test]
    fn test_kubectl_exec_wrapping() {
        let (builder, config) = builder("smf");
        let mut s = step(Method::Get, "http://localhost:8080/health");
        s.pod_exec = Some("smf-pod-0".to_string());

        let command = command_of(
            builder
                .build(&s, &track(), "sess", host(&config), Some(KubeCli::Kubectl), &FlowContext::new())
                .unwrap(),
        );
        assert!(command.starts_with("kubectl exec smf-pod-0 -n core5g -- curl -v"));
    }

    #[test]
    fn test_pod_mode_suppresses_wrapping() {
        let config: Arc<EngineConfig> = Arc::new(
            serde_json::from_value(json!({
                "nf_name": "smf",
                "pod_mode": true,
                "hosts": [{"name": "h", "cli": "oc"}]
            }))
            .unwrap(),
        );
        let builder = CommandBuilder::new(
            Arc::clone(&config),
            Arc::new(InstanceTracker::new(HashMap::new())),
        );
        let mut s = step(Method::Get, "http://localhost:8080/health");
        s.pod_exec = Some("pod-0".to_string());

        let command = command_of(
            builder
                .build(&s, &track(), "sess", &config.hosts[0], None, &FlowContext::new())
                .unwrap(),
        );
        assert!(command.starts_with("curl -v"), "pod mode runs curl directly");
    }
}
