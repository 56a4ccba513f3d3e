//! Lifecycle supervision
//!
//! The supervisor is the top of the process: it launches the bundled
//! orchestrator as a subprocess, brings up the proxy and the cluster
//! watchers once the orchestrator has produced its kubeconfig, and on
//! SIGINT/SIGTERM stops the orchestrator and exits only after it has been
//! reaped. Every startup wait is bounded; a precondition that never arrives
//! is a fatal error, not an infinite hang.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal as unix_signal, Signal as SignalStream, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{InstallLayout, LocalConfig};
use crate::monitor::{Monitor, WatchSet};
use crate::proxy::{self, AdaptiveProxy};
use crate::retry::{poll_until, retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Supervisor timing knobs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long the orchestrator may take to produce its kubeconfig before
    /// startup is abandoned
    pub startup_deadline: Duration,
    /// How long the orchestrator may take to exit after SIGTERM before it is
    /// killed outright
    pub shutdown_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_deadline: Duration::from_secs(5 * 60),
            shutdown_deadline: Duration::from_secs(2 * 60),
        }
    }
}

/// Assemble the orchestrator command line from the local node configuration.
/// Server mode starts (or resumes) this node's own cluster; join mode runs
/// as an agent of an existing server node.
pub fn build_orchestrator_args(layout: &InstallLayout, local: &LocalConfig) -> Vec<String> {
    let mut args = match &local.join {
        Some(join) => vec![
            "agent".to_string(),
            "--server".to_string(),
            format!("https://{}:6443", join.server),
            "--token".to_string(),
            join.token.clone(),
            "--node-ip".to_string(),
            local.bind_address.clone(),
        ],
        None => vec![
            "server".to_string(),
            "--write-kubeconfig".to_string(),
            layout.kubeconfig().display().to_string(),
            "--bind-address".to_string(),
            local.bind_address.clone(),
        ],
    };
    args.push("--data-dir".to_string());
    args.push(layout.data_dir().join("k3s").display().to_string());
    args
}

/// The top-level process supervisor
pub struct Supervisor {
    layout: InstallLayout,
    local: LocalConfig,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Create a supervisor for the given install
    pub fn new(layout: InstallLayout, local: LocalConfig, config: SupervisorConfig) -> Self {
        Self {
            layout,
            local,
            config,
        }
    }

    /// Run the server until a shutdown signal arrives, then stop the
    /// orchestrator and return. Returns an error for any fatal startup
    /// failure or if the proxy dies.
    pub async fn run(&self) -> Result<()> {
        self.layout.ensure_directories()?;
        self.acquire_pid_lock()?;
        proxy::tls::ensure_server_keys(&self.layout)?;

        let bind_address: IpAddr = self.local.bind_address.parse().map_err(|_| {
            Error::config(format!(
                "invalid bind address {:?} in local configuration",
                self.local.bind_address
            ))
        })?;

        let monitor = Arc::new(Monitor::new(Some(self.layout.monitor_status())));
        let adaptive = AdaptiveProxy::new(monitor.clone(), &self.layout, bind_address)?;
        let mut proxy_task = tokio::spawn(adaptive.serve());

        let mut sigterm = unix_signal(SignalKind::terminate())?;
        let mut sigint = unix_signal(SignalKind::interrupt())?;

        let mut child = self.spawn_orchestrator()?;
        let run_result = self
            .run_until_shutdown(&monitor, &mut proxy_task, &mut sigterm, &mut sigint)
            .await;

        let stop_result = self
            .stop_orchestrator(&mut child, &mut sigterm, &mut sigint)
            .await;
        self.remove_pid_files();

        run_result.and(stop_result)
    }

    /// Bring the cluster-facing subsystems up, then park until a signal
    /// arrives or the proxy fails. Signals are honored during startup too:
    /// a shutdown request while still waiting for the orchestrator's
    /// credentials must not hang for the full startup deadline.
    async fn run_until_shutdown(
        &self,
        monitor: &Arc<Monitor>,
        proxy_task: &mut JoinHandle<Result<()>>,
        sigterm: &mut SignalStream,
        sigint: &mut SignalStream,
    ) -> Result<()> {
        let client = tokio::select! {
            result = self.wait_for_cluster(monitor) => result?,
            _ = sigterm.recv() => {
                info!("received SIGTERM during startup, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("received SIGINT during startup, shutting down");
                return Ok(());
            }
            joined = &mut *proxy_task => return Err(proxy_failure(joined)),
        };

        WatchSet::new(client.clone(), monitor.clone(), &self.local.app_namespace).spawn();
        let periodic = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run_periodic_check(client).await })
        };
        info!("server is up, monitoring cluster health");

        let result = tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                Ok(())
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                Ok(())
            }
            joined = &mut *proxy_task => Err(proxy_failure(joined)),
        };
        periodic.abort();
        result
    }

    /// Wait for the orchestrator's kubeconfig, build a client from it, and
    /// confirm first API contact. Both waits are bounded.
    async fn wait_for_cluster(&self, monitor: &Arc<Monitor>) -> Result<Client> {
        let kubeconfig_path = self.layout.kubeconfig();
        // Agent-mode orchestrators never write a kubeconfig; the join step
        // must have copied one from the server node, so polling for it
        // would only burn the startup deadline
        if self.local.join.is_some() && !kubeconfig_path.exists() {
            return Err(Error::startup(format!(
                "join mode needs cluster credentials at {}; copy config/kubeconfig.yaml from the server node",
                kubeconfig_path.display()
            )));
        }
        info!(path = %kubeconfig_path.display(), "waiting for orchestrator credentials");
        poll_until(
            "orchestrator kubeconfig",
            Duration::from_secs(1),
            self.config.startup_deadline,
            || {
                let path = kubeconfig_path.clone();
                async move { path.exists().then_some(()) }
            },
        )
        .await?;

        let kubeconfig = Kubeconfig::read_from(&kubeconfig_path)
            .map_err(|e| Error::startup(format!("cannot read orchestrator kubeconfig: {}", e)))?;
        let kube_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::startup(format!("unusable orchestrator kubeconfig: {}", e)))?;
        let client = Client::try_from(kube_config)?;

        let version = retry_with_backoff(
            &RetryConfig::with_max_attempts(30),
            "initial cluster API contact",
            || {
                let client = client.clone();
                async move { client.apiserver_version().await }
            },
        )
        .await
        .map_err(|e| Error::startup(format!("cluster API never became reachable: {}", e)))?;

        monitor.set_api_reachable(
            true,
            &format!("connected to cluster API version {}", version.git_version),
        );
        Ok(client)
    }

    /// Refuse to start while a previous server instance is still alive.
    /// A pid file pointing at a dead process is stale and reclaimed.
    fn acquire_pid_lock(&self) -> Result<()> {
        let path = self.layout.server_pid();
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(pid) = content.trim().parse::<i32>() {
                if signal::kill(Pid::from_raw(pid), None).is_ok() {
                    return Err(Error::startup(format!(
                        "another server instance is already running (pid {})",
                        pid
                    )));
                }
                info!(pid, "reclaiming stale pid file");
            }
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(())
    }

    fn spawn_orchestrator(&self) -> Result<Child> {
        let binary = self.layout.orchestrator_binary();
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.orchestrator_log())?;
        let log_err = log.try_clone()?;

        let args = build_orchestrator_args(&self.layout, &self.local);
        info!(binary = %binary.display(), mode = %args[0], "starting orchestrator");
        let child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                Error::startup(format!(
                    "cannot start orchestrator {}: {}",
                    binary.display(),
                    e
                ))
            })?;

        if let Some(pid) = child.id() {
            std::fs::write(self.layout.orchestrator_pid(), pid.to_string())?;
        }
        Ok(child)
    }

    /// Stop the orchestrator: SIGTERM, bounded wait, SIGKILL on timeout.
    /// A second shutdown signal while waiting kills it immediately.
    async fn stop_orchestrator(
        &self,
        child: &mut Child,
        sigterm: &mut SignalStream,
        sigint: &mut SignalStream,
    ) -> Result<()> {
        let Some(raw_pid) = child.id() else {
            // Already exited; just reap it
            child.wait().await?;
            return Ok(());
        };
        let pid = Pid::from_raw(raw_pid as i32);

        info!(pid = raw_pid, "stopping orchestrator");
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!(pid = raw_pid, error = %e, "cannot signal orchestrator");
        }

        tokio::select! {
            waited = tokio::time::timeout(self.config.shutdown_deadline, child.wait()) => {
                match waited {
                    Ok(status) => {
                        let status = status?;
                        info!(%status, "orchestrator exited");
                    }
                    Err(_) => {
                        warn!(
                            pid = raw_pid,
                            deadline = ?self.config.shutdown_deadline,
                            "orchestrator did not stop in time, killing it"
                        );
                        let _ = signal::kill(pid, Signal::SIGKILL);
                        child.wait().await?;
                    }
                }
            }
            _ = sigterm.recv() => {
                warn!("second signal received, killing orchestrator immediately");
                let _ = signal::kill(pid, Signal::SIGKILL);
                child.wait().await?;
            }
            _ = sigint.recv() => {
                warn!("second signal received, killing orchestrator immediately");
                let _ = signal::kill(pid, Signal::SIGKILL);
                child.wait().await?;
            }
        }
        Ok(())
    }

    fn remove_pid_files(&self) {
        for path in [self.layout.server_pid(), self.layout.orchestrator_pid()] {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn proxy_failure(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Error {
    match joined {
        Ok(Ok(())) => Error::proxy("proxy exited unexpectedly"),
        Ok(Err(e)) => e,
        Err(e) => Error::proxy(format!("proxy task failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_supervisor(home: &std::path::Path, shutdown_deadline: Duration) -> Supervisor {
        Supervisor::new(
            InstallLayout::new(home),
            LocalConfig::default(),
            SupervisorConfig {
                startup_deadline: Duration::from_secs(1),
                shutdown_deadline,
            },
        )
    }

    async fn signal_streams() -> (SignalStream, SignalStream) {
        (
            unix_signal(SignalKind::terminate()).unwrap(),
            unix_signal(SignalKind::interrupt()).unwrap(),
        )
    }

    #[test]
    fn server_mode_args() {
        let layout = InstallLayout::new("/opt/bundle");
        let local = LocalConfig {
            bind_address: "10.0.0.2".to_string(),
            ..Default::default()
        };

        let args = build_orchestrator_args(&layout, &local);
        assert_eq!(args[0], "server");
        assert!(args.contains(&"--write-kubeconfig".to_string()));
        assert!(args.contains(&"/opt/bundle/config/kubeconfig.yaml".to_string()));
        assert!(args.contains(&"--bind-address".to_string()));
        assert!(args.contains(&"10.0.0.2".to_string()));
        assert!(args.contains(&"/opt/bundle/data/k3s".to_string()));
    }

    #[test]
    fn join_mode_args() {
        let layout = InstallLayout::new("/opt/bundle");
        let local = LocalConfig {
            bind_address: "10.0.0.3".to_string(),
            join: Some(crate::config::JoinConfig {
                server: "10.0.0.2".to_string(),
                token: "abc123".to_string(),
            }),
            ..Default::default()
        };

        let args = build_orchestrator_args(&layout, &local);
        assert_eq!(args[0], "agent");
        assert!(args.contains(&"https://10.0.0.2:6443".to_string()));
        assert!(args.contains(&"abc123".to_string()));
        assert!(args.contains(&"--node-ip".to_string()));
        assert!(!args.contains(&"--write-kubeconfig".to_string()));
    }

    #[test]
    fn pid_lock_refuses_live_process() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(home.path(), Duration::from_secs(1));
        supervisor.layout.ensure_directories().unwrap();

        // Our own pid is certainly alive
        std::fs::write(
            supervisor.layout.server_pid(),
            std::process::id().to_string(),
        )
        .unwrap();

        let err = supervisor.acquire_pid_lock().unwrap_err();
        assert!(matches!(err, Error::Startup(_)));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn pid_lock_reclaims_stale_file() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(home.path(), Duration::from_secs(1));
        supervisor.layout.ensure_directories().unwrap();

        // Max pid on Linux is far below this; the file is stale
        std::fs::write(supervisor.layout.server_pid(), "999999999").unwrap();

        supervisor.acquire_pid_lock().unwrap();
        let written = std::fs::read_to_string(supervisor.layout.server_pid()).unwrap();
        assert_eq!(written, std::process::id().to_string());
    }

    #[tokio::test]
    async fn stop_terminates_cooperative_child() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(home.path(), Duration::from_secs(30));
        let (mut sigterm, mut sigint) = signal_streams().await;

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();

        let start = Instant::now();
        supervisor
            .stop_orchestrator(&mut child, &mut sigterm, &mut sigint)
            .await
            .unwrap();

        // SIGTERM should end the child well before the shutdown deadline
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stop_kills_child_that_ignores_sigterm() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(home.path(), Duration::from_millis(300));
        let (mut sigterm, mut sigint) = signal_streams().await;

        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        // Give the shell a moment to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        supervisor
            .stop_orchestrator(&mut child, &mut sigterm, &mut sigint)
            .await
            .unwrap();

        // The deadline elapsed and SIGKILL finished the job
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn startup_wait_is_interrupted_by_shutdown_signal() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            InstallLayout::new(home.path()),
            LocalConfig::default(),
            SupervisorConfig {
                startup_deadline: Duration::from_secs(30),
                shutdown_deadline: Duration::from_secs(1),
            },
        );
        supervisor.layout.ensure_directories().unwrap();

        let monitor = Arc::new(Monitor::new(None));
        // Stands in for the real proxy; never completes
        let mut proxy_task =
            tokio::spawn(async { futures::future::pending::<crate::Result<()>>().await });
        let (mut sigterm, mut sigint) = signal_streams().await;

        // Raised now, observed by the stream once the select polls it
        signal::kill(nix::unistd::Pid::this(), Signal::SIGTERM).unwrap();

        // No kubeconfig will ever appear; only the signal can end the wait,
        // well before the 30s startup deadline
        let start = Instant::now();
        supervisor
            .run_until_shutdown(&monitor, &mut proxy_task, &mut sigterm, &mut sigint)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        proxy_task.abort();
    }

    #[tokio::test]
    async fn join_mode_without_credentials_fails_fast() {
        let home = tempfile::tempdir().unwrap();
        let mut supervisor = test_supervisor(home.path(), Duration::from_secs(1));
        supervisor.local.join = Some(crate::config::JoinConfig {
            server: "10.0.0.2".to_string(),
            token: "abc123".to_string(),
        });
        supervisor.layout.ensure_directories().unwrap();

        let monitor = Arc::new(Monitor::new(None));
        let start = Instant::now();
        let err = supervisor.wait_for_cluster(&monitor).await.err().unwrap();

        assert!(matches!(err, Error::Startup(_)));
        assert!(err.to_string().contains("credentials"));
        // The failure is immediate, not a timed-out poll
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn stop_reaps_already_exited_child() {
        let home = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(home.path(), Duration::from_secs(1));
        let (mut sigterm, mut sigint) = signal_streams().await;

        let mut child = Command::new("true").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        supervisor
            .stop_orchestrator(&mut child, &mut sigterm, &mut sigint)
            .await
            .unwrap();
    }
}
