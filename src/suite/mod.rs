// Module: Suite
// The TestStep/TestFlow data model and the suite loader. Spreadsheet
// parsing itself is an external collaborator; the engine consumes its
// interchange form: an ordered list of sheets, each an ordered list of
// rows keyed by the recognized column names (case-insensitive).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ConfigError, InputError};

/// HTTP methods the engine dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str, sheet: &str, row: usize) -> Result<Self, InputError> {
        match raw.trim().to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(InputError::UnknownMethod {
                sheet: sheet.to_string(),
                row,
                method: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step of a flow. Immutable after load.
#[derive(Debug, Clone, Serialize)]
pub struct TestStep {
    /// Spreadsheet row number (header is row 1, first data row is 2).
    pub row_idx: usize,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Inline JSON/text, or a file name under the payloads directory.
    pub payload: Option<String>,
    /// Status predicate: exact ("200"), class ("2xx"), list ("200,201")
    /// or range ("410-415"). Empty means "200 only".
    pub expected_status: String,
    pub pattern_match: Option<String>,
    /// Reference payload: inline JSON or a file name.
    pub response_payload: Option<String>,
    /// Container hint enabling kubectl/oc exec wrapping.
    pub pod_exec: Option<String>,
    pub save_as: Option<String>,
    pub compare_with: Option<String>,
    pub reqs_per_sec: Option<f64>,
}

/// An ordered sequence of steps sharing a Test_Name within one sheet.
#[derive(Debug, Clone, Serialize)]
pub struct TestFlow {
    pub sheet: String,
    pub test_name: String,
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Default)]
pub struct Suite {
    pub flows: Vec<TestFlow>,
}

/// Interchange form of one parsed sheet.
#[derive(Debug, Deserialize)]
struct SheetDoc {
    sheet: String,
    rows: Vec<HashMap<String, Value>>,
}

/// A payload cell holds inline content when it starts like JSON;
/// anything else is a file reference.
pub fn is_inline_payload(cell: &str) -> bool {
    matches!(cell.trim_start().chars().next(), Some('{') | Some('['))
}

/// Case-insensitive column lookup with aliases, in alias order.
fn cell<'a>(row: &'a HashMap<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        for (key, value) in row {
            if key.eq_ignore_ascii_case(alias) && !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

fn cell_string(row: &HashMap<String, Value>, aliases: &[&str]) -> Option<String> {
    cell(row, aliases).and_then(|v| match v {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        // Inline JSON cells (pattern/payload) may arrive pre-parsed.
        other => Some(other.to_string()),
    })
}

fn cell_f64(row: &HashMap<String, Value>, aliases: &[&str]) -> Option<f64> {
    cell(row, aliases).and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Parses a Headers cell. Accepts a JSON object, or `k: v` pairs
/// separated by newlines or semicolons.
fn parse_headers(cell: &str) -> Vec<(String, String)> {
    let trimmed = cell.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return map
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    Value::Null => None,
                    other => Some((k, other.to_string())),
                })
                .collect();
        }
    }
    trimmed
        .split(|c| c == '\n' || c == ';')
        .filter_map(|line| {
            let line = line.trim();
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

impl Suite {
    /// Loads the interchange document and groups adjacent rows with the
    /// same Test_Name into flows, in sheet order.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, InputError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let sheets: Vec<SheetDoc> =
            serde_json::from_str(&content).map_err(|source| InputError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut flows = Vec::new();
        for doc in sheets {
            Self::load_sheet(&doc, &mut flows)?;
        }
        Ok(Suite { flows })
    }

    fn load_sheet(doc: &SheetDoc, flows: &mut Vec<TestFlow>) -> Result<(), InputError> {
        let mut current: Option<TestFlow> = None;

        for (i, row) in doc.rows.iter().enumerate() {
            // Header occupies row 1 in the source workbook.
            let row_idx = i + 2;

            let test_name = cell_string(row, &["test_name"]).ok_or_else(|| {
                InputError::MissingColumn {
                    sheet: doc.sheet.clone(),
                    row: row_idx,
                    column: "Test_Name".to_string(),
                }
            })?;
            let method_raw =
                cell_string(row, &["method"]).ok_or_else(|| InputError::MissingColumn {
                    sheet: doc.sheet.clone(),
                    row: row_idx,
                    column: "Method".to_string(),
                })?;
            let url = cell_string(row, &["url"]).ok_or_else(|| InputError::MissingColumn {
                sheet: doc.sheet.clone(),
                row: row_idx,
                column: "URL".to_string(),
            })?;

            let step = TestStep {
                row_idx,
                method: Method::parse(&method_raw, &doc.sheet, row_idx)?,
                url,
                headers: cell_string(row, &["headers"])
                    .map(|c| parse_headers(&c))
                    .unwrap_or_default(),
                payload: cell_string(row, &["payload", "request_payload"]),
                expected_status: cell_string(row, &["expected_status"]).unwrap_or_default(),
                pattern_match: cell_string(row, &["pattern_match"]),
                response_payload: cell_string(row, &["response_payload"]),
                pod_exec: cell_string(row, &["pod_exec", "podexec"]),
                save_as: cell_string(row, &["save_as"]),
                compare_with: cell_string(row, &["compare_with"]),
                reqs_per_sec: cell_f64(row, &["reqs_sec", "reqs_per_sec"]),
            };

            match current.as_mut() {
                Some(flow) if flow.test_name == test_name => flow.steps.push(step),
                _ => {
                    if let Some(done) = current.take() {
                        flows.push(done);
                    }
                    current = Some(TestFlow {
                        sheet: doc.sheet.clone(),
                        test_name,
                        steps: vec![step],
                    });
                }
            }
        }

        if let Some(done) = current.take() {
            flows.push(done);
        }
        Ok(())
    }

    /// Restricts the suite to the given sheets and/or test name.
    /// Empty selectors keep everything.
    pub fn select(mut self, sheets: &[String], test_name: Option<&str>) -> Result<Self, InputError> {
        if !sheets.is_empty() {
            self.flows
                .retain(|f| sheets.iter().any(|s| s.eq_ignore_ascii_case(&f.sheet)));
        }
        if let Some(name) = test_name {
            self.flows.retain(|f| f.test_name == name);
        }
        if self.flows.is_empty() {
            return Err(InputError::EmptySelection);
        }
        Ok(self)
    }

    /// Every file-referencing Response_Payload must exist on disk before
    /// the run starts; a missing reference must not become a silent pass.
    pub fn verify_reference_files(&self, payloads_dir: &Path) -> Result<(), ConfigError> {
        for flow in &self.flows {
            for step in &flow.steps {
                if let Some(reference) = &step.response_payload {
                    if !is_inline_payload(reference) {
                        let path = payloads_dir.join(reference.trim());
                        if !path.exists() {
                            return Err(ConfigError::MissingReferenceFile {
                                path,
                                sheet: flow.sheet.clone(),
                                row: step.row_idx,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suite_from(value: Value) -> Suite {
        let sheets: Vec<SheetDoc> = serde_json::from_value(value).unwrap();
        let mut flows = Vec::new();
        for doc in &sheets {
            Suite::load_sheet(doc, &mut flows).unwrap();
        }
        Suite { flows }
    }

    fn row(test_name: &str, method: &str, url: &str) -> Value {
        json!({"Test_Name": test_name, "Method": method, "URL": url})
    }

    #[test]
    fn test_adjacent_rows_with_same_test_name_form_one_flow() {
        let suite = suite_from(json!([{
            "sheet": "smoke",
            "rows": [
                row("register", "PUT", "http://nrf:8081/nnrf-nfm/v1/nf-instances/"),
                row("register", "GET", "http://nrf:8081/nnrf-nfm/v1/nf-instances/"),
                row("other", "GET", "http://nrf:8081/health"),
            ]
        }]));

        assert_eq!(suite.flows.len(), 2);
        assert_eq!(suite.flows[0].test_name, "register");
        assert_eq!(suite.flows[0].steps.len(), 2);
        assert_eq!(suite.flows[0].steps[0].row_idx, 2);
        assert_eq!(suite.flows[0].steps[1].row_idx, 3);
        assert_eq!(suite.flows[1].test_name, "other");
    }

    #[test]
    fn test_non_adjacent_same_name_forms_separate_flows() {
        let suite = suite_from(json!([{
            "sheet": "smoke",
            "rows": [
                row("a", "GET", "http://h/1"),
                row("b", "GET", "http://h/2"),
                row("a", "GET", "http://h/3"),
            ]
        }]));
        assert_eq!(suite.flows.len(), 3, "flows must be adjacency-grouped");
    }

    #[test]
    fn test_column_aliases_are_case_insensitive() {
        let suite = suite_from(json!([{
            "sheet": "s",
            "rows": [{
                "test_name": "t",
                "METHOD": "post",
                "url": "http://h/x",
                "Request_Payload": "{\"a\":1}",
                "podExec": "smf-container",
                "reqs_sec": 2.5
            }]
        }]));
        let step = &suite.flows[0].steps[0];
        assert_eq!(step.method, Method::Post);
        assert_eq!(step.payload.as_deref(), Some("{\"a\":1}"));
        assert_eq!(step.pod_exec.as_deref(), Some("smf-container"));
        assert_eq!(step.reqs_per_sec, Some(2.5));
    }

    #[test]
    fn test_unknown_method_is_an_input_error() {
        let doc: SheetDoc = serde_json::from_value(json!({
            "sheet": "s",
            "rows": [row("t", "FETCH", "http://h/x")]
        }))
        .unwrap();
        let mut flows = Vec::new();
        let err = Suite::load_sheet(&doc, &mut flows).unwrap_err();
        assert!(matches!(err, InputError::UnknownMethod { method, .. } if method == "FETCH"));
    }

    #[test]
    fn test_headers_cell_formats() {
        let pairs = parse_headers("Content-Type: application/json\nAccept: */*");
        assert_eq!(
            pairs,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ]
        );

        let pairs = parse_headers("X-A: 1; X-B: 2");
        assert_eq!(pairs.len(), 2);

        let pairs = parse_headers(r#"{"Authorization": "Bearer {token}"}"#);
        assert_eq!(
            pairs,
            vec![("Authorization".to_string(), "Bearer {token}".to_string())]
        );
    }

    #[test]
    fn test_is_inline_payload() {
        assert!(is_inline_payload("{\"a\":1}"));
        assert!(is_inline_payload("  [1,2]"));
        assert!(!is_inline_payload("register_smf.json"));
    }

    #[test]
    fn test_select_by_sheet_and_test_name() {
        let suite = suite_from(json!([
            {"sheet": "one", "rows": [row("a", "GET", "http://h/1")]},
            {"sheet": "two", "rows": [row("b", "GET", "http://h/2")]}
        ]));

        let selected = suite.select(&["two".to_string()], None).unwrap();
        assert_eq!(selected.flows.len(), 1);
        assert_eq!(selected.flows[0].sheet, "two");

        let suite = suite_from(json!([
            {"sheet": "one", "rows": [row("a", "GET", "http://h/1")]}
        ]));
        assert!(matches!(
            suite.select(&[], Some("missing")),
            Err(InputError::EmptySelection)
        ));
    }

    #[test]
    fn test_missing_reference_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut suite = suite_from(json!([{
            "sheet": "s",
            "rows": [row("t", "GET", "http://h/x")]
        }]));
        suite.flows[0].steps[0].response_payload = Some("missing_reference.json".to_string());

        let err = suite.verify_reference_files(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingReferenceFile { .. }));

        // Inline references need no file.
        suite.flows[0].steps[0].response_payload = Some("{\"ok\":true}".to_string());
        assert!(suite.verify_reference_files(dir.path()).is_ok());
    }
}
