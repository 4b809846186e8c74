// Module: Context
// Flow-scoped mutable state: values saved by Save_As, static placeholders,
// and {name} interpolation. Created at flow start, dropped at flow end;
// owned by exactly one flow executor invocation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::errors::BuildError;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("valid placeholder regex")
});

/// Mutable, flow-scoped context. Saved values take precedence over static
/// placeholders, which take precedence over the pod-mode resources map.
#[derive(Debug, Default)]
pub struct FlowContext {
    pub saved: HashMap<String, Value>,
    pub placeholders: HashMap<String, String>,
    resources: HashMap<String, String>,
}

impl FlowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pod-mode constructor: seeds the lowest-precedence layer from the
    /// resources map.
    pub fn with_resources(resources: HashMap<String, String>) -> Self {
        Self {
            saved: HashMap::new(),
            placeholders: HashMap::new(),
            resources,
        }
    }

    pub fn save(&mut self, key: impl Into<String>, value: Value) {
        self.saved.insert(key.into(), value);
    }

    pub fn set_placeholder(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.placeholders.insert(key.into(), value.into());
    }

    pub fn saved_value(&self, key: &str) -> Option<&Value> {
        self.saved.get(key)
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(value) = self.saved.get(name) {
            return Some(render_value(value));
        }
        if let Some(value) = self.placeholders.get(name) {
            return Some(value.clone());
        }
        self.resources.get(name).cloned()
    }

    /// Replaces every `{name}` token. Pure in the template and the maps:
    /// re-applying with the same bindings is a no-op.
    pub fn interpolate(&self, input: &str) -> Result<String, BuildError> {
        let mut result = String::new();
        let mut last_index = 0;

        for capture in PLACEHOLDER_RE.captures_iter(input) {
            let matched = capture.get(0).unwrap();
            result.push_str(&input[last_index..matched.start()]);
            let name = capture.get(1).unwrap().as_str();
            let resolved = self.resolve(name).ok_or_else(|| {
                BuildError::UnresolvedPlaceholder {
                    name: name.to_string(),
                }
            })?;
            result.push_str(&resolved);
            last_index = matched.end();
        }

        result.push_str(&input[last_index..]);
        Ok(result)
    }

    /// Interpolation that leaves unknown tokens in place instead of
    /// failing. Used for display-only strings (dry-run output).
    pub fn interpolate_lossy(&self, input: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                self.resolve(name).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// A saved JSON value rendered into a placeholder slot: strings bare,
/// everything else via its JSON form.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpolates_saved_values_and_placeholders() {
        let mut ctx = FlowContext::new();
        ctx.save("token", json!("T-123"));
        ctx.set_placeholder("base", "http://nrf:8081");

        let out = ctx
            .interpolate("{base}/auth with Bearer {token}")
            .unwrap();
        assert_eq!(out, "http://nrf:8081/auth with Bearer T-123");
    }

    #[test]
    fn test_saved_values_shadow_placeholders_and_resources() {
        let mut resources = HashMap::new();
        resources.insert("ns".to_string(), "from-resources".to_string());
        let mut ctx = FlowContext::with_resources(resources);
        assert_eq!(ctx.interpolate("{ns}").unwrap(), "from-resources");

        ctx.set_placeholder("ns", "from-placeholder");
        assert_eq!(ctx.interpolate("{ns}").unwrap(), "from-placeholder");

        ctx.save("ns", json!("from-saved"));
        assert_eq!(ctx.interpolate("{ns}").unwrap(), "from-saved");
    }

    #[test]
    fn test_unresolved_placeholder_is_a_build_error() {
        let ctx = FlowContext::new();
        let err = ctx.interpolate("Bearer {token}").unwrap_err();
        assert!(matches!(err, BuildError::UnresolvedPlaceholder { name } if name == "token"));
    }

    #[test]
    fn test_json_braces_are_not_placeholders() {
        let ctx = FlowContext::new();
        // `{"nfType"` does not match the identifier shape; only {id} does.
        let body = r#"{"nfType": "SMF", "items": [{}]}"#;
        assert_eq!(ctx.interpolate(body).unwrap(), body);
    }

    #[test]
    fn test_reapplying_with_same_map_is_a_noop() {
        let mut ctx = FlowContext::new();
        ctx.set_placeholder("a", "alpha");
        let once = ctx.interpolate("x {a} y").unwrap();
        let twice = ctx.interpolate(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_non_string_saved_values_render_as_json() {
        let mut ctx = FlowContext::new();
        ctx.save("count", json!(3));
        ctx.save("flag", json!(true));
        assert_eq!(ctx.interpolate("{count}/{flag}").unwrap(), "3/true");
    }

    #[test]
    fn test_lossy_interpolation_keeps_unknown_tokens() {
        let mut ctx = FlowContext::new();
        ctx.set_placeholder("known", "v");
        assert_eq!(
            ctx.interpolate_lossy("{known} {unknown}"),
            "v {unknown}"
        );
    }
}
