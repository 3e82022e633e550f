//! Starter Routing
//!
//! Maps (method, path) onto a starter node and extracts path variables.
//! Iteration order over flows and nodes is the sorted order the playbook
//! store publishes, so the first-match-wins rule is deterministic.

use crate::playbook::{Controller, PlaybookSet, Vars};

/// Sentinel method that matches every request method
pub const ANY_METHOD: &str = "ANY";

/// A routed request
#[derive(Debug, Clone)]
pub struct StarterMatch {
    pub controller: Controller,
    pub vars: Vars,
    /// Starter asked for `log-session.order_box` to be reset.
    /// Only honoured for GET; HEAD does not reset.
    pub reset_order_box: bool,
}

/// Find the starter matching a request.
///
/// Scans every node of every flow, considering only `type == "starter"`.
/// A starter matches when its method is `ANY` or equal to the request method
/// and its `urlpattern` matches the path segment-wise.
pub fn match_starter(
    app: &str,
    method: &str,
    path: &str,
    playbooks: &PlaybookSet,
) -> Option<StarterMatch> {
    for (flow, subs) in playbooks {
        for playbook in subs.values() {
            for node in playbook.values() {
                if !node.is_starter() {
                    continue;
                }
                let starter_method = node.data_str("method").unwrap_or(ANY_METHOD);
                if starter_method != ANY_METHOD && !starter_method.eq_ignore_ascii_case(method) {
                    continue;
                }
                let pattern = node.data_str("urlpattern").unwrap_or("");
                let Some(vars) = compare_path(pattern, path) else {
                    continue;
                };

                let reset_order_box = method.eq_ignore_ascii_case("GET")
                    && node.data_str("reset_order_box") == Some("true");

                return Some(StarterMatch {
                    controller: Controller {
                        app: app.to_string(),
                        flow: flow.clone(),
                        playbook: playbook.clone(),
                        starter: node.deep_copy(),
                    },
                    vars,
                    reset_order_box,
                });
            }
        }
    }
    None
}

/// Segment-wise template match.
///
/// Both sides split on `/` and must have the same segment count. Pattern
/// segments beginning with `:` bind the corresponding non-empty real segment
/// into the returned map; literal segments must match exactly.
pub fn compare_path(pattern: &str, path: &str) -> Option<Vars> {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut vars = Vars::new();
    for (pat, real) in pattern_segments.iter().zip(path_segments.iter()) {
        if let Some(name) = pat.strip_prefix(':') {
            if real.is_empty() {
                return None;
            }
            vars.insert(name.to_string(), (*real).to_string());
        } else if pat != real {
            return None;
        }
    }
    Some(vars)
}
