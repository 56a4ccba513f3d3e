//! Harbormaster - supervisory server for Kubernetes application bundles
//!
//! Harbormaster is the long-running process installed alongside a packaged,
//! single-node (or small-cluster) Kubernetes application. It owns the bundled
//! orchestrator process and decides, moment to moment, whether the system is
//! healthy enough to serve live traffic.
//!
//! # Architecture
//!
//! - The [`supervisor`] launches the orchestrator subprocess, waits for its
//!   generated kubeconfig, and coordinates graceful shutdown on SIGINT/SIGTERM
//! - The [`monitor`] watches Nodes, DaemonSets, Deployments, StatefulSets, and
//!   the ingress Service as event streams and aggregates a single
//!   `system_ready` verdict behind a mutex
//! - The [`proxy`] terminates TLS on port 443 and, per request, either forwards
//!   to the discovered ingress endpoint or serves a static site-down page
//!
//! # Modules
//!
//! - [`config`] - Install directory layout and local node configuration
//! - [`monitor`] - Readiness aggregation, problem tracking, resource watchers
//! - [`proxy`] - Adaptive reverse proxy and TLS key material
//! - [`supervisor`] - Orchestrator lifecycle and signal handling
//! - [`retry`] - Bounded retry and polling utilities
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod monitor;
pub mod proxy;
pub mod retry;
pub mod supervisor;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Plaintext listener port; exists only to redirect callers to HTTPS
pub const HTTP_PORT: u16 = 80;

/// TLS listener port for all application traffic
pub const HTTPS_PORT: u16 = 443;

/// Reserved path prefix served from local static assets regardless of
/// cluster health
pub const OPS_PREFIX: &str = "/ops/";

/// Namespace holding orchestrator-managed system workloads
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespace of the well-known ingress controller service
pub const INGRESS_SERVICE_NAMESPACE: &str = "kube-system";

/// Name of the well-known ingress controller service whose cluster IP is the
/// proxy backend
pub const INGRESS_SERVICE_NAME: &str = "traefik";
