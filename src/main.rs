//! Harbormaster server entrypoint

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use harbormaster::config::{InstallLayout, LocalConfig};
use harbormaster::supervisor::{Supervisor, SupervisorConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Supervisory server for a packaged Kubernetes application bundle
#[derive(Parser)]
#[command(name = "harbormaster", version)]
struct Cli {
    /// Install home directory of the bundle
    #[arg(long, env = "HARBORMASTER_HOME", default_value = "/opt/harbormaster")]
    home: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let layout = InstallLayout::new(&cli.home);
    info!(home = %layout.home().display(), "starting harbormaster");

    let local_config_path = layout.local_config();
    let local = if local_config_path.exists() {
        LocalConfig::load(&local_config_path)
            .with_context(|| format!("loading {}", local_config_path.display()))?
    } else {
        info!("no local configuration found, using defaults");
        LocalConfig::default()
    };

    Supervisor::new(layout, local, SupervisorConfig::default())
        .run()
        .await
        .context("server exited with an error")?;

    info!("shutdown complete");
    Ok(())
}
