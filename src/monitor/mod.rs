//! Readiness aggregation
//!
//! The monitor owns the process-wide [`ReadinessSnapshot`]: the single piece
//! of shared mutable state between the resource watchers (writers) and the
//! adaptive proxy (reader). Every update recomputes the `system_ready`
//! verdict under one mutex, so a proxy request always observes a consistent
//! snapshot.
//!
//! `system_ready` is the conjunction of:
//! - cluster API connectivity confirmed (periodic version check)
//! - at least one node ready
//! - every tracked DaemonSet, Deployment, and StatefulSet healthy
//! - the ingress endpoint discovered
//!
//! A kind with zero tracked objects counts as ready (vacuous truth). This is
//! a deliberate, load-bearing policy: a bundle that ships no StatefulSets
//! must not be held unready forever by the StatefulSet watcher.

pub mod problems;
pub mod watch;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use kube::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

pub use problems::ProblemRegistry;
pub use watch::{WatchSet, WorkloadHealth};

/// Interval of the periodic connectivity check
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

const API_PROBLEM_KEY: &str = "cannot connect to cluster API";
const NODES_PROBLEM_KEY: &str = "no nodes are ready";

/// Workload kinds whose readiness is aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::DaemonSet => write!(f, "daemonset"),
            WorkloadKind::Deployment => write!(f, "deployment"),
            WorkloadKind::StatefulSet => write!(f, "statefulset"),
        }
    }
}

/// Point-in-time aggregated cluster health, consumed by the proxy on every
/// request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessSnapshot {
    /// Cluster API connectivity confirmed by the periodic version check
    pub api_reachable: bool,
    /// Number of nodes whose Ready condition reports true
    pub ready_nodes: usize,
    /// Every tracked DaemonSet is healthy (vacuously true when none)
    pub daemon_sets_ready: bool,
    /// Every tracked Deployment is healthy (vacuously true when none)
    pub deployments_ready: bool,
    /// Every tracked StatefulSet is healthy (vacuously true when none)
    pub stateful_sets_ready: bool,
    /// Cluster-internal address of the ingress service, replaced wholesale
    /// on change
    pub ingress_endpoint: Option<IpAddr>,
    /// The single verdict driving the proxy's routing state
    pub system_ready: bool,
}

impl ReadinessSnapshot {
    fn recompute(&mut self) {
        self.system_ready = self.api_reachable
            && self.ready_nodes > 0
            && self.daemon_sets_ready
            && self.deployments_ready
            && self.stateful_sets_ready
            && self.ingress_endpoint.is_some();
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    snapshot: ReadinessSnapshot,
    registry: ProblemRegistry,
}

/// Status summary persisted to `logs/monitor.status` for out-of-band tooling
#[derive(Debug, Serialize)]
struct PersistedStatus<'a> {
    system_ready: bool,
    problems: &'a std::collections::BTreeMap<String, String>,
    warnings: &'a std::collections::BTreeMap<String, String>,
}

/// The readiness aggregator
///
/// Constructed once by the supervisor and shared (via `Arc`) with every
/// watcher and the proxy. All snapshot reads and writes go through the
/// internal mutex; no lock is held across an await point.
#[derive(Debug)]
pub struct Monitor {
    state: Mutex<MonitorState>,
    status_path: Option<PathBuf>,
}

impl Monitor {
    /// Create a monitor. When `status_path` is set, a YAML summary of active
    /// problems and warnings is rewritten on every registry change.
    pub fn new(status_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            status_path,
        }
    }

    /// A copy of the current snapshot
    pub fn snapshot(&self) -> ReadinessSnapshot {
        self.lock().snapshot.clone()
    }

    /// Update the node tally. `ready` of zero raises the "no nodes are
    /// ready" problem.
    pub fn update_nodes(&self, ready: usize, total: usize) {
        let mut state = self.lock();
        state.snapshot.ready_nodes = ready;
        let detail = format!("{} of {} nodes are available", ready, total);
        let changed = if ready == 0 {
            state.registry.found_problem(NODES_PROBLEM_KEY, &detail)
        } else {
            state.registry.resolve_problem(NODES_PROBLEM_KEY, &detail)
        };
        self.finish_update(state, changed);
    }

    /// Update a workload kind's aggregate readiness
    pub fn update_workload(&self, kind: WorkloadKind, all_ready: bool) {
        let mut state = self.lock();
        match kind {
            WorkloadKind::DaemonSet => state.snapshot.daemon_sets_ready = all_ready,
            WorkloadKind::Deployment => state.snapshot.deployments_ready = all_ready,
            WorkloadKind::StatefulSet => state.snapshot.stateful_sets_ready = all_ready,
        }
        self.finish_update(state, false);
    }

    /// Replace the ingress endpoint wholesale
    pub fn set_ingress_endpoint(&self, endpoint: Option<IpAddr>) {
        let mut state = self.lock();
        if state.snapshot.ingress_endpoint != endpoint {
            match endpoint {
                Some(ip) => info!(endpoint = %ip, "ingress endpoint discovered"),
                None => warn!("ingress endpoint lost"),
            }
            state.snapshot.ingress_endpoint = endpoint;
        }
        self.finish_update(state, false);
    }

    /// Record the outcome of a cluster API connectivity check. Readiness can
    /// never be reported before the first successful check because this is
    /// the only writer of `api_reachable`.
    pub fn set_api_reachable(&self, reachable: bool, detail: &str) {
        let mut state = self.lock();
        state.snapshot.api_reachable = reachable;
        let changed = if reachable {
            state.registry.resolve_problem(API_PROBLEM_KEY, detail)
        } else {
            state.registry.found_problem(API_PROBLEM_KEY, detail)
        };
        self.finish_update(state, changed);
    }

    /// Record a failing check on behalf of a watcher
    pub fn record_problem(&self, key: &str, description: &str) {
        let mut state = self.lock();
        let changed = state.registry.found_problem(key, description);
        self.finish_update(state, changed);
    }

    /// Clear a failing check on behalf of a watcher
    pub fn resolve_problem(&self, key: &str, message: &str) {
        let mut state = self.lock();
        let changed = state.registry.resolve_problem(key, message);
        self.finish_update(state, changed);
    }

    /// Record a warning on behalf of a watcher
    pub fn record_warning(&self, key: &str, description: &str) {
        let mut state = self.lock();
        let changed = state.registry.found_warning(key, description);
        self.finish_update(state, changed);
    }

    /// Clear a warning on behalf of a watcher
    pub fn resolve_warning(&self, key: &str, message: &str) {
        let mut state = self.lock();
        let changed = state.registry.resolve_warning(key, message);
        self.finish_update(state, changed);
    }

    /// Drop all faults recorded for a deleted object
    pub fn resolve_object(&self, key_prefix: &str) {
        let mut state = self.lock();
        let changed = state.registry.resolve_prefix(key_prefix);
        self.finish_update(state, changed);
    }

    /// Periodic connectivity loop: re-verifies API reachability with a
    /// lightweight version call and recomputes the verdict, catching silent
    /// staleness between watcher events. Runs for the life of the process.
    pub async fn run_periodic_check(&self, client: Client) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.apiserver_version().await {
                Ok(version) => {
                    self.set_api_reachable(
                        true,
                        &format!("connected to cluster API version {}", version.git_version),
                    );
                }
                Err(e) => {
                    self.set_api_reachable(false, &e.to_string());
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // A poisoned mutex means a panic mid-update; the snapshot itself is
        // plain data, so continuing with it is safe.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recompute the verdict, log readiness transitions, and persist the
    /// status file when the registry changed.
    fn finish_update(
        &self,
        mut state: std::sync::MutexGuard<'_, MonitorState>,
        registry_changed: bool,
    ) {
        let was_ready = state.snapshot.system_ready;
        state.snapshot.recompute();
        if state.snapshot.system_ready != was_ready {
            if state.snapshot.system_ready {
                info!("HEALTH: system is now ready");
            } else {
                warn!(snapshot = ?state.snapshot, "HEALTH: system is not ready");
            }
        }
        if registry_changed {
            self.persist_status(&state);
        }
    }

    fn persist_status(&self, state: &MonitorState) {
        let Some(path) = &self.status_path else {
            return;
        };
        let status = PersistedStatus {
            system_ready: state.snapshot.system_ready,
            problems: state.registry.problems(),
            warnings: state.registry.warnings(),
        };
        match serde_yaml::to_string(&status) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(path, yaml) {
                    debug!(path = %path.display(), error = %e, "cannot write monitor status");
                }
            }
            Err(e) => debug!(error = %e, "cannot serialize monitor status"),
        }
    }
}
