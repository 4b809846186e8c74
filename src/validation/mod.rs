// Module: Validation
// Three-layer response validation: status predicate, pattern match,
// reference-payload diff. One engine parameterized by Strictness; the
// strict path disables subset matching, array reordering and the
// percentage-threshold fallback. The first failing layer short-circuits.

pub mod diff;

use std::path::Path;

use crate::config::ValidationSettings;
use crate::errors::FailureKind;
use crate::pattern;
use crate::response::HttpResponse;
use crate::suite::{is_inline_payload, TestStep};

use diff::{structural_diff, DiffOptions};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// OTP mode: subset matching, array reordering, percentage threshold.
    Lenient,
    /// Audit mode: exact equivalence, order preserved, no threshold.
    Strict,
}

/// Outcome of validating one step's response.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub kind: Option<FailureKind>,
    pub reason: Option<String>,
    /// Whether the pattern layer matched, when it ran. Feeds the
    /// PATTERN_FOUND field of the structured failure log.
    pub pattern_found: Option<bool>,
    /// Structural match percentage, when a structural layer ran.
    pub match_percentage: Option<f64>,
}

impl Verdict {
    fn fail(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            kind: Some(kind),
            reason: Some(reason.into()),
            pattern_found: None,
            match_percentage: None,
        }
    }
}

/// Interprets an Expected_Status cell as a predicate over the response
/// status. Empty means "200 only".
pub fn status_matches(expected: &str, actual: u16) -> bool {
    let expected = expected.trim();
    if expected.is_empty() {
        return actual == 200;
    }

    // Class pattern: "2xx".."5xx" (and "1xx").
    if expected.len() == 3 && expected[1..].eq_ignore_ascii_case("xx") {
        if let Some(class) = expected.chars().next().and_then(|c| c.to_digit(10)) {
            if (1..=5).contains(&class) {
                let low = (class * 100) as u16;
                return actual >= low && actual <= low + 99;
            }
        }
    }

    // List: "200,201,204".
    if expected.contains(',') {
        return expected
            .split(',')
            .filter_map(|part| part.trim().parse::<u16>().ok())
            .any(|code| code == actual);
    }

    // Range: "410-415".
    if let Some((low, high)) = expected.split_once('-') {
        if let (Ok(low), Ok(high)) = (low.trim().parse::<u16>(), high.trim().parse::<u16>()) {
            return actual >= low && actual <= high;
        }
    }

    // Exact integer.
    expected
        .parse::<u16>()
        .map(|code| code == actual)
        .unwrap_or(false)
}

/// Resolves a reference payload cell: inline JSON, or a file under the
/// payloads directory (whose existence was checked at suite load).
fn load_reference(cell: &str, payloads_dir: &Path) -> Result<Value, String> {
    let content = if is_inline_payload(cell) {
        cell.to_string()
    } else {
        let path = payloads_dir.join(cell.trim());
        std::fs::read_to_string(&path)
            .map_err(|e| format!("reference payload '{}' unreadable: {}", path.display(), e))?
    };
    serde_json::from_str(&content)
        .map_err(|e| format!("reference payload is not valid JSON: {}", e))
}

/// Validates a response against the step's expectations.
pub fn validate(
    step: &TestStep,
    response: &HttpResponse,
    settings: &ValidationSettings,
    payloads_dir: &Path,
    strictness: Strictness,
) -> Verdict {
    // Layer 1: status.
    if !status_matches(&step.expected_status, response.status_code) {
        let shown = if step.expected_status.trim().is_empty() {
            "200"
        } else {
            step.expected_status.trim()
        };
        return Verdict::fail(
            FailureKind::StatusMismatch,
            format!("Status mismatch: {} vs {}", response.status_code, shown),
        );
    }

    // Layer 2: pattern.
    let mut pattern_found = None;
    let mut match_percentage = None;
    if let Some(raw) = &step.pattern_match {
        let compiled = pattern::compile(raw);
        let outcome = compiled.matches(response, strictness, settings.json_match_threshold);
        pattern_found = Some(outcome.matched);
        match_percentage = Some(outcome.percentage);
        if !outcome.matched {
            let mut verdict = Verdict::fail(
                FailureKind::PatternMismatch,
                format!(
                    "Pattern '{}' not satisfied{}",
                    raw,
                    outcome
                        .detail
                        .map(|d| format!(": {}", d))
                        .unwrap_or_default()
                ),
            );
            verdict.pattern_found = pattern_found;
            verdict.match_percentage = match_percentage;
            return verdict;
        }
    }

    // Layer 3: reference payload.
    if let Some(reference_cell) = &step.response_payload {
        let reference = match load_reference(reference_cell, payloads_dir) {
            Ok(v) => v,
            Err(reason) => {
                let mut verdict = Verdict::fail(FailureKind::PayloadMismatch, reason);
                verdict.pattern_found = pattern_found;
                return verdict;
            }
        };
        let actual = response.body_json.clone().unwrap_or(Value::Null);
        let opts = DiffOptions {
            ignore_fields: settings.ignore_fields.clone(),
            ignore_array_order: strictness == Strictness::Lenient
                && settings.ignore_array_order,
            strict: strictness == Strictness::Strict,
        };
        let result = structural_diff(&reference, &actual, &opts);
        match_percentage = Some(result.percentage);

        let passed = match strictness {
            Strictness::Lenient => result.percentage > settings.json_match_threshold,
            Strictness::Strict => result.equivalent,
        };
        if !passed {
            let preview: Vec<_> = result.differences.iter().take(5).cloned().collect();
            let mut verdict = Verdict::fail(
                FailureKind::PayloadMismatch,
                format!(
                    "Payload match {:.1}% (threshold {:.1}%): {}",
                    result.percentage,
                    settings.json_match_threshold,
                    preview.join("; ")
                ),
            );
            verdict.pattern_found = pattern_found;
            verdict.match_percentage = match_percentage;
            return verdict;
        }
    }

    Verdict {
        passed: true,
        kind: None,
        reason: None,
        pattern_found,
        match_percentage,
    }
}
