//! Resource watchers
//!
//! One task per tracked kind, each holding a private local view of that
//! kind's objects and feeding derived readiness into the shared [`Monitor`].
//! Streams come from `kube::runtime::watcher` with default backoff, so a
//! broken subscription (API restart, closed long-lived connection) is
//! resubscribed automatically instead of silently ending the watcher.
//!
//! Workload watchers track the application namespace and the system
//! namespace; objects elsewhere are ignored. The service watcher is scoped
//! to the well-known ingress service and only extracts its cluster IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Monitor, WorkloadKind};
use crate::{INGRESS_SERVICE_NAME, INGRESS_SERVICE_NAMESPACE, SYSTEM_NAMESPACE};

const INGRESS_DOWN_KEY: &str = "ingress service is not running";
const INGRESS_NO_ADDRESS_KEY: &str = "ingress service has no address";

/// Per-object readiness classification
///
/// Only `Healthy` counts toward the kind-level aggregate; `Degraded` keeps
/// the system serving but is surfaced as a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadHealth {
    /// No instances ready
    Unavailable,
    /// Serving, but some expected instances are missing
    Degraded {
        /// Number of missing instances
        missing: i32,
    },
    /// All expected instances ready
    Healthy,
}

impl WorkloadHealth {
    /// Whether this object counts as ready for aggregation
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkloadHealth::Healthy)
    }
}

impl std::fmt::Display for WorkloadHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadHealth::Unavailable => write!(f, "UNAVAILABLE. No instances ready"),
            WorkloadHealth::Degraded { missing } => {
                write!(f, "DEGRADED. {} expected instances missing", missing)
            }
            WorkloadHealth::Healthy => write!(f, "HEALTHY"),
        }
    }
}

/// Classify a DaemonSet: healthy iff at least one instance is ready and no
/// node is missing its instance
pub fn classify_daemon_set(daemon_set: &DaemonSet) -> WorkloadHealth {
    let status = daemon_set.status.as_ref();
    let ready = status.map_or(0, |s| s.number_ready);
    let unavailable = status.and_then(|s| s.number_unavailable).unwrap_or(0);

    if ready == 0 {
        WorkloadHealth::Unavailable
    } else if unavailable > 0 {
        WorkloadHealth::Degraded { missing: unavailable }
    } else {
        WorkloadHealth::Healthy
    }
}

/// Classify a Deployment: healthy iff available replicas meet the desired
/// count
pub fn classify_deployment(deployment: &Deployment) -> WorkloadHealth {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);

    if available == 0 {
        WorkloadHealth::Unavailable
    } else if available < desired {
        WorkloadHealth::Degraded {
            missing: desired - available,
        }
    } else {
        WorkloadHealth::Healthy
    }
}

/// Classify a StatefulSet: healthy iff ready replicas meet the desired count
pub fn classify_stateful_set(stateful_set: &StatefulSet) -> WorkloadHealth {
    let desired = stateful_set
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = stateful_set
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    if ready == 0 {
        WorkloadHealth::Unavailable
    } else if ready < desired {
        WorkloadHealth::Degraded {
            missing: desired - ready,
        }
    } else {
        WorkloadHealth::Healthy
    }
}

/// Whether a node's Ready condition reports true, plus the condition message
/// for fault logging
pub fn node_readiness(node: &Node) -> (bool, String) {
    let condition = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));

    match condition {
        Some(c) => (
            c.status == "True",
            c.message.clone().unwrap_or_default(),
        ),
        None => (false, "no Ready condition reported".to_string()),
    }
}

/// Kind-level aggregate: every tracked object healthy. A kind with zero
/// tracked objects is vacuously ready by policy (see module docs in
/// [`super`]).
pub fn all_healthy(objects: &HashMap<String, WorkloadHealth>) -> bool {
    objects.values().all(WorkloadHealth::is_healthy)
}

/// The set of watcher tasks feeding one monitor
pub struct WatchSet {
    client: Client,
    monitor: Arc<Monitor>,
    namespaces: Vec<String>,
}

impl WatchSet {
    /// Create a watch set tracking the given application namespace plus the
    /// system namespace
    pub fn new(client: Client, monitor: Arc<Monitor>, app_namespace: &str) -> Self {
        let mut namespaces = vec![SYSTEM_NAMESPACE.to_string()];
        if app_namespace != SYSTEM_NAMESPACE {
            namespaces.push(app_namespace.to_string());
        }
        Self {
            client,
            monitor,
            namespaces,
        }
    }

    /// Spawn one task per tracked kind. The tasks run for the lifetime of
    /// the process; handles are returned for completeness, not cancellation.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(watch_nodes(self.client.clone(), self.monitor.clone())),
            tokio::spawn(run_workload_watcher(
                Api::<DaemonSet>::all(self.client.clone()),
                self.monitor.clone(),
                WorkloadKind::DaemonSet,
                self.namespaces.clone(),
                classify_daemon_set,
            )),
            tokio::spawn(run_workload_watcher(
                Api::<Deployment>::all(self.client.clone()),
                self.monitor.clone(),
                WorkloadKind::Deployment,
                self.namespaces.clone(),
                classify_deployment,
            )),
            tokio::spawn(run_workload_watcher(
                Api::<StatefulSet>::all(self.client.clone()),
                self.monitor.clone(),
                WorkloadKind::StatefulSet,
                self.namespaces.clone(),
                classify_stateful_set,
            )),
            tokio::spawn(watch_ingress_service(
                self.client.clone(),
                self.monitor.clone(),
            )),
        ]
    }
}

fn tracked(namespaces: &[String], object_namespace: Option<String>) -> bool {
    match object_namespace {
        Some(ns) => namespaces.iter().any(|tracked| *tracked == ns),
        None => false,
    }
}

/// Generic watch loop for a workload kind
///
/// Maintains a private `namespace/name -> health` view, records per-object
/// problems/warnings, and pushes the kind aggregate to the monitor after
/// every change. Watch errors raise an edge-triggered problem and the stream
/// resumes with backoff.
async fn run_workload_watcher<K>(
    api: Api<K>,
    monitor: Arc<Monitor>,
    kind: WorkloadKind,
    namespaces: Vec<String>,
    classify: fn(&K) -> WorkloadHealth,
) where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
{
    let stream_problem_key = format!("{} watch interrupted", kind);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut objects: HashMap<String, WorkloadHealth> = HashMap::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                monitor.resolve_problem(&stream_problem_key, "watch re-established");
                match event {
                    Event::Init => {
                        // A (re)list is starting; rebuild the view from scratch
                        objects.clear();
                    }
                    Event::InitApply(obj) => {
                        apply_workload(&monitor, kind, &namespaces, &mut objects, &obj, classify);
                    }
                    Event::InitDone => {
                        monitor.update_workload(kind, all_healthy(&objects));
                    }
                    Event::Apply(obj) => {
                        apply_workload(&monitor, kind, &namespaces, &mut objects, &obj, classify);
                        monitor.update_workload(kind, all_healthy(&objects));
                    }
                    Event::Delete(obj) => {
                        let key = object_key(&obj);
                        debug!(kind = %kind, object = %key, "watch delete");
                        objects.remove(&key);
                        monitor.resolve_object(&format!("{} {}", kind, key));
                        monitor.update_workload(kind, all_healthy(&objects));
                    }
                }
            }
            Err(e) => {
                monitor.record_problem(&stream_problem_key, &e.to_string());
            }
        }
    }
    // The backoff stream is endless; reaching here means the process is
    // shutting down
    warn!(kind = %kind, "watch stream ended");
}

fn apply_workload<K>(
    monitor: &Monitor,
    kind: WorkloadKind,
    namespaces: &[String],
    objects: &mut HashMap<String, WorkloadHealth>,
    obj: &K,
    classify: fn(&K) -> WorkloadHealth,
) where
    K: kube::Resource,
    K::DynamicType: Default,
{
    if !tracked(namespaces, obj.namespace()) {
        return;
    }
    let key = object_key(obj);
    let health = classify(obj);
    debug!(kind = %kind, object = %key, health = %health, "watch apply");

    let fault_base = format!("{} {}", kind, key);
    match health {
        WorkloadHealth::Unavailable => {
            monitor.record_problem(
                &format!("{} is not ready", fault_base),
                &health.to_string(),
            );
            monitor.resolve_warning(&format!("{} is degraded", fault_base), "");
        }
        WorkloadHealth::Degraded { .. } => {
            monitor.resolve_problem(
                &format!("{} is not ready", fault_base),
                "at least one instance ready",
            );
            monitor.record_warning(&format!("{} is degraded", fault_base), &health.to_string());
        }
        WorkloadHealth::Healthy => {
            monitor.resolve_problem(
                &format!("{} is not ready", fault_base),
                &format!("{} is healthy", fault_base),
            );
            monitor.resolve_warning(
                &format!("{} is degraded", fault_base),
                &format!("{} is healthy", fault_base),
            );
        }
    }
    objects.insert(key, health);
}

fn object_key<K>(obj: &K) -> String
where
    K: kube::Resource,
    K::DynamicType: Default,
{
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Watch cluster nodes and keep the ready-node tally current
///
/// Individual unready nodes are warnings; only "no nodes ready" blocks
/// readiness, via the tally reaching zero.
async fn watch_nodes(client: Client, monitor: Arc<Monitor>) {
    let stream_problem_key = "node watch interrupted";
    let mut stream = watcher(Api::<Node>::all(client), watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut nodes: HashMap<String, bool> = HashMap::new();

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                monitor.resolve_problem(stream_problem_key, "watch re-established");
                match event {
                    Event::Init => nodes.clear(),
                    Event::InitApply(node) | Event::Apply(node) => {
                        let name = node.name_any();
                        let (ready, message) = node_readiness(&node);
                        debug!(node = %name, ready, "watch apply");
                        let warning_key = format!("node {} is not ready", name);
                        if ready {
                            monitor
                                .resolve_warning(&warning_key, &format!("node {} is ready", name));
                        } else {
                            monitor.record_warning(&warning_key, &message);
                        }
                        nodes.insert(name, ready);
                        monitor.update_nodes(ready_count(&nodes), nodes.len());
                    }
                    Event::InitDone => {
                        monitor.update_nodes(ready_count(&nodes), nodes.len());
                    }
                    Event::Delete(node) => {
                        let name = node.name_any();
                        debug!(node = %name, "watch delete");
                        nodes.remove(&name);
                        monitor.resolve_object(&format!("node {}", name));
                        monitor.update_nodes(ready_count(&nodes), nodes.len());
                    }
                }
            }
            Err(e) => {
                monitor.record_problem(stream_problem_key, &e.to_string());
            }
        }
    }
    warn!("node watch stream ended");
}

fn ready_count(nodes: &HashMap<String, bool>) -> usize {
    nodes.values().filter(|ready| **ready).count()
}

/// Watch the system namespace for the well-known ingress service and publish
/// its cluster IP as the proxy backend
async fn watch_ingress_service(client: Client, monitor: Arc<Monitor>) {
    let stream_problem_key = "service watch interrupted";
    let api: Api<Service> = Api::namespaced(client, INGRESS_SERVICE_NAMESPACE);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut relist = IngressRelist::default();

    // The ingress service does not exist until the orchestrator deploys it;
    // start from the faulted state so its absence is visible
    monitor.record_problem(INGRESS_DOWN_KEY, "service not observed yet");

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                monitor.resolve_problem(stream_problem_key, "watch re-established");
                handle_ingress_event(&monitor, &mut relist, event);
            }
            Err(e) => {
                monitor.record_problem(stream_problem_key, &e.to_string());
            }
        }
    }
    warn!("service watch stream ended");
}

/// Tracks whether the ingress service showed up between `Init` and
/// `InitDone`. A service deleted while the watch was disconnected produces
/// neither an Apply nor a Delete on resubscription, so its absence is only
/// observable at the relist boundary.
#[derive(Debug, Default)]
struct IngressRelist {
    active: bool,
    seen: bool,
}

fn handle_ingress_event(monitor: &Monitor, relist: &mut IngressRelist, event: Event<Service>) {
    match event {
        Event::Init => {
            relist.active = true;
            relist.seen = false;
        }
        Event::InitDone => {
            if relist.active && !relist.seen {
                monitor.record_problem(INGRESS_DOWN_KEY, "ingress service not present");
                monitor.set_ingress_endpoint(None);
            }
            relist.active = false;
        }
        Event::InitApply(service) | Event::Apply(service) => {
            if service.name_any() != INGRESS_SERVICE_NAME {
                return;
            }
            if relist.active {
                relist.seen = true;
            }
            monitor.resolve_problem(INGRESS_DOWN_KEY, "ingress service is running");
            match ingress_address(&service) {
                Some(ip) => {
                    monitor.resolve_problem(
                        INGRESS_NO_ADDRESS_KEY,
                        &format!("ingress is listening on {}", ip),
                    );
                    monitor.set_ingress_endpoint(Some(ip));
                }
                None => {
                    monitor.record_problem(INGRESS_NO_ADDRESS_KEY, "no cluster IP");
                    monitor.set_ingress_endpoint(None);
                }
            }
        }
        Event::Delete(service) => {
            if service.name_any() != INGRESS_SERVICE_NAME {
                return;
            }
            monitor.record_problem(INGRESS_DOWN_KEY, "ingress service deleted");
            monitor.set_ingress_endpoint(None);
        }
    }
}

/// Extract the cluster-internal address from the ingress service, if it has
/// one. Headless services ("None") and unassigned services yield nothing.
pub fn ingress_address(service: &Service) -> Option<IpAddr> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .and_then(|ip| ip.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DaemonSetStatus, DeploymentSpec, DeploymentStatus, StatefulSetSpec, StatefulSetStatus,
    };
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, ServiceSpec};

    fn daemon_set(ready: i32, unavailable: Option<i32>) -> DaemonSet {
        DaemonSet {
            status: Some(DaemonSetStatus {
                number_ready: ready,
                number_unavailable: unavailable,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(desired: i32, available: Option<i32>) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: available,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stateful_set(desired: i32, ready: Option<i32>) -> StatefulSet {
        StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    message: Some("kubelet is posting ready status".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn daemon_set_tri_state() {
        assert_eq!(
            classify_daemon_set(&daemon_set(0, None)),
            WorkloadHealth::Unavailable
        );
        assert_eq!(
            classify_daemon_set(&daemon_set(2, Some(1))),
            WorkloadHealth::Degraded { missing: 1 }
        );
        assert_eq!(
            classify_daemon_set(&daemon_set(3, Some(0))),
            WorkloadHealth::Healthy
        );
        assert_eq!(
            classify_daemon_set(&daemon_set(3, None)),
            WorkloadHealth::Healthy
        );
        // No status at all means nothing is ready
        assert_eq!(
            classify_daemon_set(&DaemonSet::default()),
            WorkloadHealth::Unavailable
        );
    }

    #[test]
    fn deployment_tri_state() {
        assert_eq!(
            classify_deployment(&deployment(3, None)),
            WorkloadHealth::Unavailable
        );
        assert_eq!(
            classify_deployment(&deployment(3, Some(0))),
            WorkloadHealth::Unavailable
        );
        assert_eq!(
            classify_deployment(&deployment(3, Some(2))),
            WorkloadHealth::Degraded { missing: 1 }
        );
        assert_eq!(
            classify_deployment(&deployment(3, Some(3))),
            WorkloadHealth::Healthy
        );
    }

    #[test]
    fn stateful_set_tri_state() {
        assert_eq!(
            classify_stateful_set(&stateful_set(2, None)),
            WorkloadHealth::Unavailable
        );
        assert_eq!(
            classify_stateful_set(&stateful_set(2, Some(1))),
            WorkloadHealth::Degraded { missing: 1 }
        );
        assert_eq!(
            classify_stateful_set(&stateful_set(2, Some(2))),
            WorkloadHealth::Healthy
        );
    }

    #[test]
    fn node_ready_condition() {
        assert!(node_readiness(&node_with_ready("True")).0);
        assert!(!node_readiness(&node_with_ready("False")).0);
        assert!(!node_readiness(&node_with_ready("Unknown")).0);
        // A node with no conditions is not ready
        let (ready, message) = node_readiness(&Node::default());
        assert!(!ready);
        assert!(message.contains("no Ready condition"));
    }

    #[test]
    fn empty_kind_is_vacuously_ready() {
        let objects: HashMap<String, WorkloadHealth> = HashMap::new();
        assert!(all_healthy(&objects));
    }

    #[test]
    fn degraded_objects_block_aggregate() {
        let mut objects = HashMap::new();
        objects.insert("shop/web".to_string(), WorkloadHealth::Healthy);
        assert!(all_healthy(&objects));

        objects.insert(
            "shop/worker".to_string(),
            WorkloadHealth::Degraded { missing: 1 },
        );
        assert!(!all_healthy(&objects));

        objects.remove("shop/worker");
        assert!(all_healthy(&objects));
    }

    #[test]
    fn ingress_address_extraction() {
        let service = |ip: Option<&str>| Service {
            spec: Some(ServiceSpec {
                cluster_ip: ip.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            ingress_address(&service(Some("10.43.0.10"))),
            Some("10.43.0.10".parse().unwrap())
        );
        assert_eq!(ingress_address(&service(Some("None"))), None);
        assert_eq!(ingress_address(&service(Some(""))), None);
        assert_eq!(ingress_address(&service(None)), None);
        assert_eq!(ingress_address(&Service::default()), None);
    }

    fn named_service(name: &str, cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn relist_without_ingress_service_clears_endpoint() {
        let monitor = Monitor::new(None);
        let mut relist = IngressRelist::default();

        handle_ingress_event(
            &monitor,
            &mut relist,
            Event::Apply(named_service("traefik", Some("10.43.0.10"))),
        );
        assert_eq!(
            monitor.snapshot().ingress_endpoint,
            Some("10.43.0.10".parse().unwrap())
        );

        // The service was deleted while the watch was disconnected: the
        // resubscription relist delivers no event for it at all
        handle_ingress_event(&monitor, &mut relist, Event::Init);
        handle_ingress_event(&monitor, &mut relist, Event::InitDone);

        assert_eq!(monitor.snapshot().ingress_endpoint, None);
    }

    #[test]
    fn relist_redelivering_ingress_service_keeps_endpoint() {
        let monitor = Monitor::new(None);
        let mut relist = IngressRelist::default();

        handle_ingress_event(&monitor, &mut relist, Event::Init);
        handle_ingress_event(
            &monitor,
            &mut relist,
            Event::InitApply(named_service("traefik", Some("10.43.0.10"))),
        );
        handle_ingress_event(&monitor, &mut relist, Event::InitDone);

        assert_eq!(
            monitor.snapshot().ingress_endpoint,
            Some("10.43.0.10".parse().unwrap())
        );
    }

    #[test]
    fn other_services_do_not_count_as_ingress() {
        let monitor = Monitor::new(None);
        let mut relist = IngressRelist::default();

        handle_ingress_event(&monitor, &mut relist, Event::Init);
        handle_ingress_event(
            &monitor,
            &mut relist,
            Event::InitApply(named_service("metrics-server", Some("10.43.0.20"))),
        );
        handle_ingress_event(&monitor, &mut relist, Event::InitDone);

        assert_eq!(monitor.snapshot().ingress_endpoint, None);
    }

    #[test]
    fn namespace_filter() {
        let namespaces = vec!["kube-system".to_string(), "shop".to_string()];
        assert!(tracked(&namespaces, Some("shop".to_string())));
        assert!(tracked(&namespaces, Some("kube-system".to_string())));
        assert!(!tracked(&namespaces, Some("other".to_string())));
        assert!(!tracked(&namespaces, None));
    }
}
