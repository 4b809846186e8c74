// Module: Pattern
// Classifies a Pattern_Match cell into one of six kinds, compiles it once
// (regex / parsed JSON / path), and checks it against a response. Compiled
// forms are cached by the pattern string for the lifetime of the run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::response::HttpResponse;
use crate::validation::Strictness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Substring,
    KeyValue,
    MultiKeyValue,
    JsonObject,
    JsonArray,
    JsonPath,
    Regex,
}

/// A pattern with its pre-parsed form. Built through [`compile`]; cheap to
/// clone via Arc.
#[derive(Debug)]
pub struct CompiledPattern {
    pub raw: String,
    pub kind: PatternKind,
    json: Option<Value>,
    regex: Option<Regex>,
    pairs: Vec<(String, String)>,
    path: Option<String>,
}

/// Outcome of a pattern check. `percentage` is meaningful for structural
/// kinds; binary kinds report 0 or 100.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub matched: bool,
    pub percentage: f64,
    pub detail: Option<String>,
}

impl MatchOutcome {
    fn hit() -> Self {
        Self {
            matched: true,
            percentage: 100.0,
            detail: None,
        }
    }

    fn miss(detail: impl Into<String>) -> Self {
        Self {
            matched: false,
            percentage: 0.0,
            detail: Some(detail.into()),
        }
    }
}

static CACHE: Lazy<Mutex<HashMap<String, Arc<CompiledPattern>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Regex metacharacters that do not occur in the plain-text patterns the
/// suites use. `.` and `{}` are deliberately absent: dots appear in hosts
/// and versions, braces in placeholders and JSON.
const REGEX_METACHARS: &[char] = &['\\', '^', '*', '+', '?', '[', ']', '(', ')', '|'];

/// Deterministic classification; the order of the checks is part of the
/// contract.
pub fn classify(pattern: &str) -> PatternKind {
    let trimmed = pattern.trim();

    if trimmed.starts_with('$') {
        return PatternKind::JsonPath;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value {
            Value::Object(_) => return PatternKind::JsonObject,
            Value::Array(_) => return PatternKind::JsonArray,
            _ => {} // scalars fall through to the text kinds
        }
    }

    let slash_wrapped = trimmed.len() > 1 && trimmed.starts_with('/') && trimmed.ends_with('/');
    if slash_wrapped || trimmed.chars().any(|c| REGEX_METACHARS.contains(&c)) {
        let body = if slash_wrapped {
            &trimmed[1..trimmed.len() - 1]
        } else {
            trimmed
        };
        if Regex::new(body).is_ok() {
            return PatternKind::Regex;
        }
    }

    if has_unquoted(trimmed, ':') {
        if has_unquoted(trimmed, ',') {
            return PatternKind::MultiKeyValue;
        }
        return PatternKind::KeyValue;
    }

    PatternKind::Substring
}

fn has_unquoted(text: &str, needle: char) -> bool {
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return true,
            _ => {}
        }
    }
    false
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn parse_pairs(text: &str) -> Vec<(String, String)> {
    text.split(',')
        .filter_map(|part| {
            let (k, v) = part.split_once(':')?;
            Some((
                strip_quotes(k).to_string(),
                strip_quotes(v).to_string(),
            ))
        })
        .collect()
}

/// Compiles (or fetches from cache) the pattern's matcher form.
pub fn compile(pattern: &str) -> Arc<CompiledPattern> {
    if let Some(hit) = CACHE.lock().expect("pattern cache poisoned").get(pattern) {
        return Arc::clone(hit);
    }

    let kind = classify(pattern);
    let trimmed = pattern.trim();
    let compiled = CompiledPattern {
        raw: pattern.to_string(),
        kind,
        json: match kind {
            PatternKind::JsonObject | PatternKind::JsonArray => {
                serde_json::from_str(trimmed).ok()
            }
            _ => None,
        },
        regex: match kind {
            PatternKind::Regex => {
                let body = if trimmed.len() > 1 && trimmed.starts_with('/') && trimmed.ends_with('/')
                {
                    &trimmed[1..trimmed.len() - 1]
                } else {
                    trimmed
                };
                Regex::new(body).ok()
            }
            _ => None,
        },
        pairs: match kind {
            PatternKind::KeyValue | PatternKind::MultiKeyValue => parse_pairs(trimmed),
            _ => Vec::new(),
        },
        path: match kind {
            PatternKind::JsonPath => Some(trimmed.to_string()),
            _ => None,
        },
    };

    let arc = Arc::new(compiled);
    CACHE
        .lock()
        .expect("pattern cache poisoned")
        .insert(pattern.to_string(), Arc::clone(&arc));
    arc
}

impl CompiledPattern {
    /// Checks the pattern against the response body (and headers / captured
    /// pod logs for the textual kinds).
    pub fn matches(
        &self,
        response: &HttpResponse,
        strictness: Strictness,
        threshold_pct: f64,
    ) -> MatchOutcome {
        match self.kind {
            PatternKind::Substring => self.match_substring(response),
            PatternKind::Regex => self.match_regex(response),
            PatternKind::KeyValue | PatternKind::MultiKeyValue => self.match_pairs(response),
            PatternKind::JsonPath => self.match_jsonpath(response),
            PatternKind::JsonObject | PatternKind::JsonArray => {
                self.match_structural(response, strictness, threshold_pct)
            }
        }
    }

    fn match_substring(&self, response: &HttpResponse) -> MatchOutcome {
        let needle = self.raw.trim();
        if response.body_text.contains(needle) {
            return MatchOutcome::hit();
        }
        if response
            .headers
            .iter()
            .any(|(k, v)| format!("{}: {}", k, v).contains(needle))
        {
            return MatchOutcome::hit();
        }
        if let Some(logs) = &response.log_text {
            if logs.contains(needle) {
                return MatchOutcome::hit();
            }
        }
        MatchOutcome::miss(format!("substring '{}' not found", needle))
    }

    fn match_regex(&self, response: &HttpResponse) -> MatchOutcome {
        let Some(re) = &self.regex else {
            return MatchOutcome::miss("regex failed to compile");
        };
        if re.is_match(&response.body_text) {
            return MatchOutcome::hit();
        }
        if let Some(logs) = &response.log_text {
            if re.is_match(logs) {
                return MatchOutcome::hit();
            }
        }
        MatchOutcome::miss(format!("regex '{}' has no match", re.as_str()))
    }

    fn match_pairs(&self, response: &HttpResponse) -> MatchOutcome {
        let Some(body) = &response.body_json else {
            return MatchOutcome::miss("response body is not JSON");
        };
        let total = self.pairs.len() as f64;
        let mut missing = Vec::new();
        for (key, expected) in &self.pairs {
            if !contains_pair(body, key, expected) {
                missing.push(format!("{}:{}", key, expected));
            }
        }
        if missing.is_empty() {
            MatchOutcome::hit()
        } else {
            let matched = total - missing.len() as f64;
            MatchOutcome {
                matched: false,
                percentage: if total > 0.0 { matched / total * 100.0 } else { 0.0 },
                detail: Some(format!("pairs not found: {}", missing.join(", "))),
            }
        }
    }

    fn match_jsonpath(&self, response: &HttpResponse) -> MatchOutcome {
        let Some(body) = &response.body_json else {
            return MatchOutcome::miss("response body is not JSON");
        };
        let path = self.path.as_deref().unwrap_or("$");
        match extract(body, path) {
            Some(Value::Null) | None => {
                MatchOutcome::miss(format!("jsonpath '{}' yielded no result", path))
            }
            Some(Value::Array(items)) if items.is_empty() => {
                MatchOutcome::miss(format!("jsonpath '{}' yielded an empty set", path))
            }
            Some(_) => MatchOutcome::hit(),
        }
    }

    fn match_structural(
        &self,
        response: &HttpResponse,
        strictness: Strictness,
        threshold_pct: f64,
    ) -> MatchOutcome {
        let Some(body) = &response.body_json else {
            return MatchOutcome::miss("response body is not JSON");
        };
        let Some(pattern) = &self.json else {
            return MatchOutcome::miss("pattern failed to parse as JSON");
        };

        match strictness {
            Strictness::Strict => {
                let mut diffs = Vec::new();
                if strict_equal(pattern, body, "$", &mut diffs) {
                    MatchOutcome::hit()
                } else {
                    MatchOutcome {
                        matched: false,
                        percentage: 0.0,
                        detail: Some(diffs.join("; ")),
                    }
                }
            }
            Strictness::Lenient => {
                let (matched, total) = score_subset(pattern, Some(body));
                let percentage = if total == 0 {
                    100.0
                } else {
                    matched as f64 / total as f64 * 100.0
                };
                let passed = percentage >= threshold_pct && percentage > 0.0;
                MatchOutcome {
                    matched: passed,
                    percentage,
                    detail: if passed {
                        None
                    } else {
                        Some(format!(
                            "structural match {:.1}% below threshold {:.1}%",
                            percentage, threshold_pct
                        ))
                    },
                }
            }
        }
    }
}

/// Scalar comparison with light coercion: "true" matches true, numeric
/// strings match numbers.
fn eq_coerce(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (expected, actual) {
        (Value::String(s), Value::Bool(b)) | (Value::Bool(b), Value::String(s)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|parsed| n.as_f64() == Some(parsed))
            .unwrap_or(false),
        _ => false,
    }
}

fn eq_coerce_str(expected: &str, actual: &Value) -> bool {
    match actual {
        Value::String(s) => s == expected,
        Value::Bool(b) => expected.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        Value::Number(n) => expected
            .trim()
            .parse::<f64>()
            .map(|parsed| n.as_f64() == Some(parsed))
            .unwrap_or(false),
        Value::Null => expected.eq_ignore_ascii_case("null"),
        _ => false,
    }
}

/// Depth-first search for `key == expected` anywhere in the document.
fn contains_pair(value: &Value, key: &str, expected: &str) -> bool {
    match value {
        Value::Object(map) => {
            if let Some(actual) = map.get(key) {
                if eq_coerce_str(expected, actual) {
                    return true;
                }
            }
            map.values().any(|v| contains_pair(v, key, expected))
        }
        Value::Array(items) => items.iter().any(|v| contains_pair(v, key, expected)),
        _ => false,
    }
}

/// Lenient subset scoring: returns (matched, total) over the pattern's
/// scalar leaves. A `null` pattern leaf only requires the key to exist.
/// Array elements may match any actual element (reordering allowed), each
/// actual element consumed at most once.
fn score_subset(pattern: &Value, actual: Option<&Value>) -> (u32, u32) {
    match pattern {
        Value::Object(map) => {
            let mut matched = 0;
            let mut total = 0;
            for (key, sub) in map {
                let (m, t) = score_subset(sub, actual.and_then(|a| a.get(key)));
                matched += m;
                total += t;
            }
            (matched, total)
        }
        Value::Array(items) => {
            let mut matched = 0;
            let mut total = 0;
            let empty = Vec::new();
            let actual_items = actual.and_then(|a| a.as_array()).unwrap_or(&empty);
            let mut used = vec![false; actual_items.len()];
            for item in items {
                let (_, item_total) = score_subset(item, None);
                let item_total = item_total.max(1);
                // Greedy: claim the best unconsumed counterpart.
                let mut best: Option<(usize, u32)> = None;
                for (i, candidate) in actual_items.iter().enumerate() {
                    if used[i] {
                        continue;
                    }
                    let (m, _) = score_subset(item, Some(candidate));
                    if best.map(|(_, bm)| m > bm).unwrap_or(m > 0) {
                        best = Some((i, m));
                    }
                }
                if let Some((i, m)) = best {
                    used[i] = true;
                    matched += m;
                }
                total += item_total;
            }
            (matched, total)
        }
        Value::Null => match actual {
            // "key must exist, value unconstrained"
            Some(_) => (1, 1),
            None => (0, 1),
        },
        scalar => match actual {
            Some(actual) if eq_coerce(scalar, actual) => (1, 1),
            _ => (0, 1),
        },
    }
}

/// Strict equivalence: same keys both ways, arrays index-wise with equal
/// length, no coercion beyond the `null`-means-exists rule.
fn strict_equal(pattern: &Value, actual: &Value, path: &str, diffs: &mut Vec<String>) -> bool {
    match (pattern, actual) {
        (Value::Object(p), Value::Object(a)) => {
            let mut ok = true;
            for (key, sub) in p {
                let sub_path = format!("{}.{}", path, key);
                match a.get(key) {
                    Some(actual_sub) => {
                        if !strict_equal(sub, actual_sub, &sub_path, diffs) {
                            ok = false;
                        }
                    }
                    None => {
                        diffs.push(format!("{} missing", sub_path));
                        ok = false;
                    }
                }
            }
            for key in a.keys() {
                if !p.contains_key(key) {
                    diffs.push(format!("{}.{} unexpected", path, key));
                    ok = false;
                }
            }
            ok
        }
        (Value::Array(p), Value::Array(a)) => {
            if p.len() != a.len() {
                diffs.push(format!(
                    "{} length {} != {}",
                    path,
                    a.len(),
                    p.len()
                ));
                return false;
            }
            let mut ok = true;
            for (i, (sub, actual_sub)) in p.iter().zip(a.iter()).enumerate() {
                if !strict_equal(sub, actual_sub, &format!("{}[{}]", path, i), diffs) {
                    ok = false;
                }
            }
            ok
        }
        (Value::Null, _) => true,
        (p, a) => {
            if p == a {
                true
            } else {
                diffs.push(format!("{}: {} != {}", path, a, p));
                false
            }
        }
    }
}

/// Walks a JSON document along a dotted path. Accepts `$.a.b`, `a.b`,
/// `items[0].id` and the `[*]` wildcard (which yields the array itself).
/// Used both for JSONPath patterns and for Save_As extraction.
pub fn extract(body: &Value, path: &str) -> Option<Value> {
    let clean = path.trim().strip_prefix('$').unwrap_or(path.trim());
    let clean = clean.strip_prefix('.').unwrap_or(clean);
    if clean.is_empty() {
        return Some(body.clone());
    }

    let mut current = body.clone();
    for segment in split_path(clean) {
        current = step_into(&current, &segment)?;
    }
    Some(current)
}

fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                current.push('[');
                for next in chars.by_ref() {
                    current.push(next);
                    if next == ']' {
                        break;
                    }
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn step_into(value: &Value, segment: &str) -> Option<Value> {
    if segment.starts_with('[') && segment.ends_with(']') {
        let index = &segment[1..segment.len() - 1];
        if index == "*" {
            return match value {
                Value::Array(_) => Some(value.clone()),
                _ => None,
            };
        }
        let index: usize = index.parse().ok()?;
        return value.as_array()?.get(index).cloned();
    }
    value.as_object()?.get(segment).cloned()
}
