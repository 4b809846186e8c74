// Module: NRF tracker
// Stack-based tracking of nfInstanceId values across PUT/GET/PATCH/DELETE
// sequences. Active only when the configured NF identity is NRF; every
// other NF takes the legacy path and never consults this module.
//
// Sessions are flow-scoped (keyed sheet::test_name::host) and accessed by
// one executor at a time; the session map itself is guarded by a single
// mutex so cross-session cleanup serializes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::suite::Method;

/// When an instance left behind by a test gets cleaned up automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    TestEnd,
    SuiteEnd,
    SessionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,
    Deleted,
}

/// Identifies the step a tracker operation originates from.
#[derive(Debug, Clone)]
pub struct TrackContext {
    pub sheet: String,
    pub test_name: String,
    pub row_idx: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub method: Method,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NrfInstanceRecord {
    pub nf_instance_id: String,
    pub created_by_test: String,
    pub created_in_sheet: String,
    pub created_at_row: usize,
    pub created_ts: DateTime<Utc>,
    pub operations: Vec<OperationRecord>,
    pub status: InstanceStatus,
    pub deletion_reason: Option<String>,
    pub cleanup_policy: CleanupPolicy,
}

#[derive(Debug, Default)]
struct NrfSession {
    registry: HashMap<String, NrfInstanceRecord>,
    /// LIFO stack of active ids; always a subset of the registry's
    /// Active entries.
    active_stack: Vec<String>,
    last_test_name: Option<String>,
    last_sheet: Option<String>,
}

/// Snapshot returned by [`InstanceTracker::diagnostic`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostic {
    pub active_count: usize,
    pub stack: Vec<String>,
    pub by_test: HashMap<String, usize>,
    pub by_status: HashMap<String, usize>,
    /// Active registry entries missing from the stack; always empty
    /// unless the invariant broke.
    pub orphans: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InstanceTracker {
    sessions: Mutex<HashMap<String, NrfSession>>,
    cleanup_overrides: HashMap<String, CleanupPolicy>,
}

/// Builds the session key for a flow on a host.
pub fn session_key(sheet: &str, test_name: &str, host: &str) -> String {
    format!("{}::{}::{}", sheet, test_name, host)
}

impl InstanceTracker {
    pub fn new(cleanup_overrides: HashMap<String, CleanupPolicy>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            cleanup_overrides,
        }
    }

    fn derive_policy(&self, test_name: &str) -> CleanupPolicy {
        let lowered = test_name.to_lowercase();
        for (substring, policy) in &self.cleanup_overrides {
            if lowered.contains(&substring.to_lowercase()) {
                return *policy;
            }
        }
        if lowered.contains("registration") {
            CleanupPolicy::TestEnd
        } else if lowered.contains("discovery") {
            CleanupPolicy::SuiteEnd
        } else {
            CleanupPolicy::SessionEnd
        }
    }

    /// PUT ingested a new instance id: push and register it.
    pub fn on_put(&self, session: &str, ctx: &TrackContext, id: &str) {
        let policy = self.derive_policy(&ctx.test_name);
        let mut sessions = self.sessions.lock().expect("nrf session map poisoned");
        let state = sessions.entry(session.to_string()).or_default();

        state.active_stack.push(id.to_string());
        state.registry.insert(
            id.to_string(),
            NrfInstanceRecord {
                nf_instance_id: id.to_string(),
                created_by_test: ctx.test_name.clone(),
                created_in_sheet: ctx.sheet.clone(),
                created_at_row: ctx.row_idx,
                created_ts: Utc::now(),
                operations: vec![OperationRecord {
                    method: Method::Put,
                    ts: Utc::now(),
                }],
                status: InstanceStatus::Active,
                deletion_reason: None,
                cleanup_policy: policy,
            },
        );
        tracing::debug!(session, id, ?policy, "nrf instance registered");
    }

    /// The id a GET/PATCH should target: newest instance created by this
    /// test, else the top of the stack, else none.
    pub fn select_for(&self, session: &str, ctx: &TrackContext, method: Method) -> Option<String> {
        let mut sessions = self.sessions.lock().expect("nrf session map poisoned");
        let state = sessions.get_mut(session)?;
        let id = Self::pick(state, &ctx.test_name)?;
        if let Some(record) = state.registry.get_mut(&id) {
            record.operations.push(OperationRecord {
                method,
                ts: Utc::now(),
            });
        }
        Some(id)
    }

    fn pick(state: &NrfSession, test_name: &str) -> Option<String> {
        state
            .active_stack
            .iter()
            .rev()
            .find(|id| {
                state
                    .registry
                    .get(*id)
                    .map(|r| r.created_by_test == test_name)
                    .unwrap_or(false)
            })
            .or_else(|| state.active_stack.last())
            .cloned()
    }

    /// DELETE: removes the selected id from the stack (the specific id,
    /// not merely the top) and marks it deleted. None signals "no active
    /// instance, skip the command".
    pub fn on_delete(&self, session: &str, ctx: &TrackContext) -> Option<String> {
        let mut sessions = self.sessions.lock().expect("nrf session map poisoned");
        let state = sessions.get_mut(session)?;
        let id = Self::pick(state, &ctx.test_name)?;

        state.active_stack.retain(|candidate| candidate != &id);
        if let Some(record) = state.registry.get_mut(&id) {
            record.status = InstanceStatus::Deleted;
            record.deletion_reason = Some("DELETE".to_string());
            record.operations.push(OperationRecord {
                method: Method::Delete,
                ts: Utc::now(),
            });
        }
        tracing::debug!(session, %id, "nrf instance deleted");
        Some(id)
    }

    /// Called before every tracked step. A test-name transition cleans up
    /// TestEnd instances left by the previous test; a sheet transition
    /// additionally cleans up SuiteEnd instances.
    pub fn track_progression(&self, session: &str, ctx: &TrackContext) {
        let mut sessions = self.sessions.lock().expect("nrf session map poisoned");
        let state = sessions.entry(session.to_string()).or_default();

        if let Some(previous_sheet) = state.last_sheet.clone() {
            if previous_sheet != ctx.sheet {
                Self::auto_cleanup(state, |record| {
                    record.created_in_sheet == previous_sheet
                        && matches!(
                            record.cleanup_policy,
                            CleanupPolicy::TestEnd | CleanupPolicy::SuiteEnd
                        )
                }, "auto_cleanup_suite_end");
            }
        }
        if let Some(previous_test) = state.last_test_name.clone() {
            if previous_test != ctx.test_name {
                Self::auto_cleanup(state, |record| {
                    record.created_by_test == previous_test
                        && record.cleanup_policy == CleanupPolicy::TestEnd
                }, "auto_cleanup_test_end");
            }
        }

        state.last_test_name = Some(ctx.test_name.clone());
        state.last_sheet = Some(ctx.sheet.clone());
    }

    /// Session teardown: everything still active is cleaned up.
    pub fn end_session(&self, session: &str) {
        let mut sessions = self.sessions.lock().expect("nrf session map poisoned");
        if let Some(state) = sessions.get_mut(session) {
            Self::auto_cleanup(state, |_| true, "auto_cleanup_session_end");
        }
    }

    fn auto_cleanup<F>(state: &mut NrfSession, mut matches: F, reason: &str)
    where
        F: FnMut(&NrfInstanceRecord) -> bool,
    {
        let doomed: Vec<String> = state
            .active_stack
            .iter()
            .filter(|id| state.registry.get(*id).map(&mut matches).unwrap_or(false))
            .cloned()
            .collect();
        for id in doomed {
            state.active_stack.retain(|candidate| candidate != &id);
            if let Some(record) = state.registry.get_mut(&id) {
                record.status = InstanceStatus::Deleted;
                record.deletion_reason = Some(reason.to_string());
            }
            tracing::debug!(%id, reason, "nrf instance auto-cleaned");
        }
    }

    pub fn active_count(&self, session: &str) -> usize {
        let sessions = self.sessions.lock().expect("nrf session map poisoned");
        sessions
            .get(session)
            .map(|s| s.active_stack.len())
            .unwrap_or(0)
    }

    pub fn diagnostic(&self, session: &str) -> SessionDiagnostic {
        let sessions = self.sessions.lock().expect("nrf session map poisoned");
        let Some(state) = sessions.get(session) else {
            return SessionDiagnostic {
                active_count: 0,
                stack: Vec::new(),
                by_test: HashMap::new(),
                by_status: HashMap::new(),
                orphans: Vec::new(),
            };
        };

        let mut by_test: HashMap<String, usize> = HashMap::new();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for record in state.registry.values() {
            *by_test.entry(record.created_by_test.clone()).or_default() += 1;
            let status = match record.status {
                InstanceStatus::Active => "active",
                InstanceStatus::Deleted => "deleted",
            };
            *by_status.entry(status.to_string()).or_default() += 1;
        }
        let orphans = state
            .registry
            .values()
            .filter(|r| r.status == InstanceStatus::Active)
            .map(|r| r.nf_instance_id.clone())
            .filter(|id| !state.active_stack.contains(id))
            .collect();

        SessionDiagnostic {
            active_count: state.active_stack.len(),
            stack: state.active_stack.clone(),
            by_test,
            by_status,
            orphans,
        }
    }

    /// Test/debug helper: the stack-subset-of-active-registry invariant.
    #[cfg(test)]
    fn invariant_holds(&self, session: &str) -> bool {
        let sessions = self.sessions.lock().expect("nrf session map poisoned");
        let Some(state) = sessions.get(session) else {
            return true;
        };
        state.active_stack.iter().all(|id| {
            state
                .registry
                .get(id)
                .map(|r| r.status == InstanceStatus::Active)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(sheet: &str, test_name: &str, row: usize) -> TrackContext {
        TrackContext {
            sheet: sheet.to_string(),
            test_name: test_name.to_string(),
            row_idx: row,
        }
    }

    fn tracker() -> InstanceTracker {
        InstanceTracker::new(HashMap::new())
    }

    #[test]
    fn test_put_get_delete_lifecycle() {
        let t = tracker();
        let session = session_key("smoke", "smf_flow", "nrf-1");
        let c = ctx("smoke", "smf_flow", 2);

        t.on_put(&session, &c, "abc-123");
        assert!(t.invariant_holds(&session));
        assert_eq!(
            t.select_for(&session, &c, Method::Get),
            Some("abc-123".to_string())
        );
        assert_eq!(t.on_delete(&session, &c), Some("abc-123".to_string()));
        assert_eq!(t.active_count(&session), 0);
        assert!(t.invariant_holds(&session));
    }

    #[test]
    fn test_double_delete_returns_none() {
        let t = tracker();
        let session = session_key("smoke", "smf_flow", "nrf-1");
        let c = ctx("smoke", "smf_flow", 2);

        t.on_put(&session, &c, "abc-123");
        assert!(t.on_delete(&session, &c).is_some());
        assert!(
            t.on_delete(&session, &c).is_none(),
            "second DELETE must signal skip, never an id"
        );
        assert!(t.select_for(&session, &c, Method::Get).is_none());
    }

    #[test]
    fn test_select_prefers_instances_created_by_same_test() {
        let t = tracker();
        let session = "s".to_string();
        t.on_put(&session, &ctx("sheet", "flow_a", 2), "id-a");
        t.on_put(&session, &ctx("sheet", "flow_b", 3), "id-b");

        // flow_a finds its own instance under flow_b's on the stack.
        assert_eq!(
            t.select_for(&session, &ctx("sheet", "flow_a", 4), Method::Get),
            Some("id-a".to_string())
        );
        // An unrelated test falls back to the top of the stack.
        assert_eq!(
            t.select_for(&session, &ctx("sheet", "flow_c", 5), Method::Patch),
            Some("id-b".to_string())
        );
    }

    #[test]
    fn test_delete_removes_the_specific_id_not_the_top() {
        let t = tracker();
        let session = "s".to_string();
        t.on_put(&session, &ctx("sheet", "flow_a", 2), "id-a");
        t.on_put(&session, &ctx("sheet", "flow_b", 3), "id-b");

        assert_eq!(
            t.on_delete(&session, &ctx("sheet", "flow_a", 4)),
            Some("id-a".to_string())
        );
        assert!(t.invariant_holds(&session));
        let diag = t.diagnostic(&session);
        assert_eq!(diag.stack, vec!["id-b".to_string()], "id-b stays on top");
    }

    #[test]
    fn test_registration_tests_are_cleaned_at_test_end() {
        let t = tracker();
        let session = "s".to_string();
        let reg = ctx("sheet", "smf_registration_basic", 2);
        t.track_progression(&session, &reg);
        t.on_put(&session, &reg, "reg-1");
        assert_eq!(t.active_count(&session), 1);

        // Next test arrives: registration instances are auto-cleaned.
        t.track_progression(&session, &ctx("sheet", "unrelated_flow", 5));
        assert_eq!(t.active_count(&session), 0);
        assert!(t.invariant_holds(&session));
        assert_eq!(t.diagnostic(&session).by_status.get("deleted"), Some(&1));
    }

    #[test]
    fn test_discovery_tests_survive_test_end_but_not_sheet_end() {
        let t = tracker();
        let session = "s".to_string();
        let disc = ctx("sheet_one", "nf_discovery_check", 2);
        t.track_progression(&session, &disc);
        t.on_put(&session, &disc, "disc-1");

        t.track_progression(&session, &ctx("sheet_one", "next_flow", 5));
        assert_eq!(t.active_count(&session), 1, "suite_end policy survives a test transition");

        t.track_progression(&session, &ctx("sheet_two", "next_flow", 2));
        assert_eq!(t.active_count(&session), 0, "sheet transition cleans suite_end instances");
    }

    #[test]
    fn test_cleanup_policy_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("registration".to_string(), CleanupPolicy::SessionEnd);
        let t = InstanceTracker::new(overrides);
        let session = "s".to_string();
        let reg = ctx("sheet", "smf_registration_basic", 2);
        t.track_progression(&session, &reg);
        t.on_put(&session, &reg, "reg-1");

        t.track_progression(&session, &ctx("sheet", "other", 5));
        assert_eq!(
            t.active_count(&session),
            1,
            "override changed registration to session_end"
        );
    }

    #[test]
    fn test_end_session_cleans_everything() {
        let t = tracker();
        let session = "s".to_string();
        t.on_put(&session, &ctx("sheet", "a", 2), "one");
        t.on_put(&session, &ctx("sheet", "b", 3), "two");
        t.end_session(&session);
        assert_eq!(t.active_count(&session), 0);
        let diag = t.diagnostic(&session);
        assert_eq!(diag.by_status.get("deleted"), Some(&2));
        assert!(diag.orphans.is_empty());
    }

    #[test]
    fn test_diagnostic_counts() {
        let t = tracker();
        let session = "s".to_string();
        t.on_put(&session, &ctx("sheet", "a", 2), "one");
        t.on_put(&session, &ctx("sheet", "a", 3), "two");
        t.on_delete(&session, &ctx("sheet", "a", 4));

        let diag = t.diagnostic(&session);
        assert_eq!(diag.active_count, 1);
        assert_eq!(diag.by_test.get("a"), Some(&2));
        assert_eq!(diag.by_status.get("active"), Some(&1));
        assert_eq!(diag.by_status.get("deleted"), Some(&1));
        assert!(diag.orphans.is_empty());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let t = tracker();
        t.on_put("one", &ctx("sheet", "a", 2), "id-1");
        assert_eq!(t.active_count("one"), 1);
        assert_eq!(t.active_count("two"), 0);
        assert!(t
            .select_for("two", &ctx("sheet", "a", 3), Method::Get)
            .is_none());
    }
}
