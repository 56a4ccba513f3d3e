//! Install directory layout and local node configuration
//!
//! Every installed bundle lives under a single home directory. All paths the
//! server touches - the orchestrator binary, its generated kubeconfig, TLS key
//! material, static web assets, log and pid files - are derived from that home
//! through [`InstallLayout`] so components never hard-code locations.
//!
//! [`LocalConfig`] is the per-node configuration written at install time. It
//! selects server vs join-as-agent mode for the orchestrator and names the
//! application namespace the monitor tracks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Resolved filesystem layout of an installed bundle
///
/// Owns no state beyond the home path; cheap to clone and pass to each
/// component at construction.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    home: PathBuf,
}

impl InstallLayout {
    /// Create a layout rooted at the given install home
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// The install home directory
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Runtime data directory (`data/`)
    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    /// Log directory (`logs/`)
    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Static web asset root (`data/web/`), including the site-down page and
    /// everything under the reserved `/ops/` prefix
    pub fn web_root(&self) -> PathBuf {
        self.data_dir().join("web")
    }

    /// Local node configuration file (`config/local.yaml`)
    pub fn local_config(&self) -> PathBuf {
        self.home.join("config").join("local.yaml")
    }

    /// Kubeconfig written by the orchestrator once its API is up
    /// (`config/kubeconfig.yaml`). Its existence gates watcher startup.
    pub fn kubeconfig(&self) -> PathBuf {
        self.home.join("config").join("kubeconfig.yaml")
    }

    /// Self-signed server certificate (`data/ssl-cert.pem`)
    pub fn tls_cert(&self) -> PathBuf {
        self.data_dir().join("ssl-cert.pem")
    }

    /// Server private key (`data/ssl-key.pem`)
    pub fn tls_key(&self) -> PathBuf {
        self.data_dir().join("ssl-key.pem")
    }

    /// Pid file of the supervisor itself (`data/server.pid`)
    pub fn server_pid(&self) -> PathBuf {
        self.data_dir().join("server.pid")
    }

    /// Pid file of the orchestrator subprocess (`data/server.k3s.pid`)
    pub fn orchestrator_pid(&self) -> PathBuf {
        self.data_dir().join("server.k3s.pid")
    }

    /// The bundled orchestrator binary (`lib/k3s`)
    pub fn orchestrator_binary(&self) -> PathBuf {
        self.home.join("lib").join("k3s")
    }

    /// Orchestrator log file (`logs/k3s.log`)
    pub fn orchestrator_log(&self) -> PathBuf {
        self.logs_dir().join("k3s.log")
    }

    /// Monitor status summary written on every problem-registry change
    /// (`logs/monitor.status`)
    pub fn monitor_status(&self) -> PathBuf {
        self.logs_dir().join("monitor.status")
    }

    /// Create the writable directories the server needs at runtime
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.data_dir(), self.logs_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Join configuration for running the orchestrator as an agent of an
/// existing server node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    /// Host of the server node to join
    pub server: String,
    /// Cluster join token
    pub token: String,
}

/// Per-node configuration written by the installer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalConfig {
    /// IP address the orchestrator and proxy bind to
    pub bind_address: String,

    /// Namespace the application's workloads are deployed into
    pub app_namespace: String,

    /// When set, the orchestrator joins an existing cluster as an agent
    /// instead of starting its own server
    pub join: Option<JoinConfig>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            app_namespace: "default".to_string(),
            join: None,
        }
    }
}

impl LocalConfig {
    /// Load the configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))
    }
}
