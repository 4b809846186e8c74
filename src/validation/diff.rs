// Structural JSON diff between a reference payload and a response body.
// Drives the payload validation layer: strict mode demands equivalence,
// lenient mode scores a match percentage over the reference's leaves.

use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Dotted paths removed from both documents before comparison.
    pub ignore_fields: Vec<String>,
    /// Lenient mode only: array elements may match in any order.
    pub ignore_array_order: bool,
    pub strict: bool,
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    /// True only when the documents are fully equivalent under the options.
    pub equivalent: bool,
    /// Matched reference leaves over total reference leaves, percent.
    pub percentage: f64,
    pub differences: Vec<String>,
}

/// Removes every configured dotted path from the document. A path like
/// `a.b.c` deletes the key `c` under `a.b`; array levels are traversed
/// element-wise.
pub fn remove_ignored(value: &mut Value, paths: &[String]) {
    for path in paths {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        if !segments.is_empty() {
            remove_path(value, &segments);
        }
    }
}

fn remove_path(value: &mut Value, segments: &[&str]) {
    match value {
        Value::Object(map) => {
            if segments.len() == 1 {
                map.remove(segments[0]);
            } else if let Some(child) = map.get_mut(segments[0]) {
                remove_path(child, &segments[1..]);
            }
        }
        Value::Array(items) => {
            for item in items {
                remove_path(item, segments);
            }
        }
        _ => {}
    }
}

/// Diffs `actual` against the `expected` reference.
pub fn structural_diff(expected: &Value, actual: &Value, opts: &DiffOptions) -> DiffResult {
    let mut expected = expected.clone();
    let mut actual = actual.clone();
    remove_ignored(&mut expected, &opts.ignore_fields);
    remove_ignored(&mut actual, &opts.ignore_fields);

    let mut differences = Vec::new();
    let (matched, total) = compare(&expected, Some(&actual), "$", opts, &mut differences);

    if opts.strict {
        // Equivalence also requires the actual document to carry nothing
        // beyond the reference.
        collect_extras(&expected, &actual, "$", &mut differences);
    }

    let percentage = if total == 0 {
        100.0
    } else {
        matched as f64 / total as f64 * 100.0
    };

    DiffResult {
        equivalent: differences.is_empty(),
        percentage,
        differences,
    }
}

/// Recursive scorer over the reference's scalar leaves. Returns
/// (matched, total) and records a difference per mismatch.
fn compare(
    expected: &Value,
    actual: Option<&Value>,
    path: &str,
    opts: &DiffOptions,
    differences: &mut Vec<String>,
) -> (u32, u32) {
    match expected {
        Value::Object(map) => {
            let mut matched = 0;
            let mut total = 0;
            for (key, sub) in map {
                let sub_path = format!("{}.{}", path, key);
                let sub_actual = actual.and_then(|a| a.get(key));
                if sub_actual.is_none() {
                    let (_, t) = count_leaves(sub);
                    differences.push(format!("{} missing", sub_path));
                    total += t;
                    continue;
                }
                let (m, t) = compare(sub, sub_actual, &sub_path, opts, differences);
                matched += m;
                total += t;
            }
            (matched, total)
        }
        Value::Array(items) => {
            let empty = Vec::new();
            let actual_items = actual.and_then(|a| a.as_array()).unwrap_or(&empty);

            if opts.strict && items.len() != actual_items.len() {
                differences.push(format!(
                    "{} length {} != {}",
                    path,
                    actual_items.len(),
                    items.len()
                ));
            }

            let unordered = !opts.strict && opts.ignore_array_order;
            let mut matched = 0;
            let mut total = 0;

            if unordered {
                let mut used = vec![false; actual_items.len()];
                for (i, item) in items.iter().enumerate() {
                    let (_, item_total) = count_leaves(item);
                    let mut best: Option<(usize, u32)> = None;
                    for (j, candidate) in actual_items.iter().enumerate() {
                        if used[j] {
                            continue;
                        }
                        let mut scratch = Vec::new();
                        let (m, _) = compare(item, Some(candidate), path, opts, &mut scratch);
                        if best.map(|(_, bm)| m > bm).unwrap_or(true) {
                            best = Some((j, m));
                        }
                    }
                    match best {
                        Some((j, m)) => {
                            used[j] = true;
                            if m < item_total {
                                differences
                                    .push(format!("{}[{}] partial match", path, i));
                            }
                            matched += m;
                        }
                        None => differences.push(format!("{}[{}] unmatched", path, i)),
                    }
                    total += item_total;
                }
            } else {
                for (i, item) in items.iter().enumerate() {
                    let sub_path = format!("{}[{}]", path, i);
                    let sub_actual = actual_items.get(i);
                    if sub_actual.is_none() {
                        let (_, t) = count_leaves(item);
                        differences.push(format!("{} missing", sub_path));
                        total += t;
                        continue;
                    }
                    let (m, t) = compare(item, sub_actual, &sub_path, opts, differences);
                    matched += m;
                    total += t;
                }
            }
            (matched, total)
        }
        scalar => {
            let hit = actual.map(|a| a == scalar).unwrap_or(false);
            if !hit {
                differences.push(format!(
                    "{}: {} != {}",
                    path,
                    actual.map(|a| a.to_string()).unwrap_or_else(|| "<absent>".into()),
                    scalar
                ));
            }
            (hit as u32, 1)
        }
    }
}

/// Leaf count of a subtree; a bare scalar counts as one.
fn count_leaves(value: &Value) -> (u32, u32) {
    match value {
        Value::Object(map) => {
            let mut total = 0;
            for sub in map.values() {
                total += count_leaves(sub).1;
            }
            (0, total)
        }
        Value::Array(items) => {
            let mut total = 0;
            for item in items {
                total += count_leaves(item).1;
            }
            (0, total.max(1))
        }
        _ => (0, 1),
    }
}

/// Strict equivalence also fails on keys present in `actual` but absent
/// from the reference.
fn collect_extras(expected: &Value, actual: &Value, path: &str, differences: &mut Vec<String>) {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            for (key, sub_actual) in a {
                let sub_path = format!("{}.{}", path, key);
                match e.get(key) {
                    Some(sub_expected) => {
                        collect_extras(sub_expected, sub_actual, &sub_path, differences)
                    }
                    None => differences.push(format!("{} unexpected", sub_path)),
                }
            }
        }
        (Value::Array(e), Value::Array(a)) => {
            for (i, (sub_expected, sub_actual)) in e.iter().zip(a.iter()).enumerate() {
                collect_extras(sub_expected, sub_actual, &format!("{}[{}]", path, i), differences);
            }
        }
        _ => {}
    }
}
