//! Edge-triggered problem and warning tracking
//!
//! The registry records the onset and resolution of faults so the log carries
//! one PROBLEM line when a check starts failing and one RESOLVED line when it
//! recovers, instead of a line per observation. Problems gate `system_ready`;
//! warnings are purely informational (an individual unready node is a warning,
//! "no nodes ready" is a problem).

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

/// Registry of currently failing checks, keyed by a stable problem key
///
/// Not internally synchronized; owned by the monitor behind its mutex.
#[derive(Debug, Default)]
pub struct ProblemRegistry {
    problems: BTreeMap<String, String>,
    warnings: BTreeMap<String, String>,
    seen: HashSet<String>,
}

impl ProblemRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a check is failing. Logs only when the problem is new or
    /// its description changed. Returns true if the registry changed.
    pub fn found_problem(&mut self, key: &str, description: &str) -> bool {
        self.seen.insert(key.to_string());
        match self.problems.get(key) {
            Some(existing) if existing == description => false,
            _ => {
                warn!(problem = %key, detail = %description, "PROBLEM");
                self.problems.insert(key.to_string(), description.to_string());
                true
            }
        }
    }

    /// Record that a check is passing. Logs only when an active problem is
    /// being cleared. Returns true if the registry changed.
    pub fn resolve_problem(&mut self, key: &str, message: &str) -> bool {
        if self.problems.remove(key).is_some() {
            info!(problem = %key, detail = %message, "RESOLVED");
            return true;
        }
        // First healthy observation of a check we have never seen fail
        if self.seen.insert(key.to_string()) {
            debug!(check = %key, detail = %message, "check passing");
        }
        false
    }

    /// Record a warning-level fault. Same edge semantics as problems but does
    /// not affect readiness.
    pub fn found_warning(&mut self, key: &str, description: &str) -> bool {
        match self.warnings.get(key) {
            Some(existing) if existing == description => false,
            _ => {
                warn!(warning = %key, detail = %description, "WARNING");
                self.warnings.insert(key.to_string(), description.to_string());
                true
            }
        }
    }

    /// Clear a warning-level fault
    pub fn resolve_warning(&mut self, key: &str, message: &str) -> bool {
        if self.warnings.remove(key).is_some() {
            info!(warning = %key, detail = %message, "RESOLVED");
            return true;
        }
        false
    }

    /// Drop every problem and warning whose key starts with `prefix`.
    /// Used when a tracked object is deleted and its faults become moot.
    pub fn resolve_prefix(&mut self, prefix: &str) -> bool {
        let before = self.problems.len() + self.warnings.len();
        self.problems.retain(|k, _| !k.starts_with(prefix));
        self.warnings.retain(|k, _| !k.starts_with(prefix));
        self.seen.retain(|k| !k.starts_with(prefix));
        before != self.problems.len() + self.warnings.len()
    }

    /// Whether any problem is currently active
    pub fn has_problems(&self) -> bool {
        !self.problems.is_empty()
    }

    /// Currently active problems, sorted by key
    pub fn problems(&self) -> &BTreeMap<String, String> {
        &self.problems
    }

    /// Currently active warnings, sorted by key
    pub fn warnings(&self) -> &BTreeMap<String, String> {
        &self.warnings
    }
}
