//! kluster-controller: the hub, relays, task scheduler and broadcast tree of
//! one cluster in a single process.
//!
//! # Usage
//!
//! ```bash
//! kluster-controller --profile-dir ~/.kluster/profile_default
//! kluster-controller --config kluster.toml --scheme lru --reuse
//! KLUSTER_TRANSPORT_IP=0.0.0.0 kluster-controller --location 10.0.0.5
//! ```

use std::path::PathBuf;

use clap::Parser;
use kluster_controller::{Controller, Shutdown, UnitRunnerConfig};
use kluster_core::ClusterConfig;

#[derive(Parser, Debug)]
#[command(name = "kluster-controller", version, about)]
struct Cli {
    /// Path to kluster.toml (default: <profile-dir>/kluster.toml if present).
    #[arg(long, env = "KLUSTER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    profile_dir: Option<PathBuf>,

    #[arg(long)]
    cluster_id: Option<String>,

    /// Task scheme: leastload, lru, pure or none.
    #[arg(long)]
    scheme: Option<String>,

    /// Reuse existing connection files and keep them on exit.
    #[arg(long)]
    reuse: bool,

    /// Reload engines registered with a previous controller.
    #[arg(long)]
    restore: bool,

    /// Interface to bind on.
    #[arg(long)]
    ip: Option<String>,

    /// Address advertised in connection files.
    #[arg(long)]
    location: Option<String>,

    #[arg(long)]
    base_port: Option<u16>,
}

impl Cli {
    fn apply(self, config: &mut ClusterConfig) {
        if let Some(id) = self.cluster_id {
            config.cluster.cluster_id = id;
        }
        if let Some(scheme) = self.scheme {
            config.controller.scheme = scheme;
        }
        if self.reuse {
            config.controller.reuse_files = true;
        }
        if self.restore {
            config.controller.restore_engines = true;
        }
        if let Some(ip) = self.ip {
            config.transport.ip = ip;
        }
        if let Some(location) = self.location {
            config.transport.location = Some(location);
        }
        if let Some(port) = self.base_port {
            config.transport.base_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kluster_core::profile::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting kluster-controller");

    let mut config = ClusterConfig::discover(cli.config.as_deref(), cli.profile_dir.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let controller = Controller::new(config)?;
    controller
        .run(Shutdown::new(), UnitRunnerConfig::default())
        .await?;

    tracing::info!("kluster-controller exited cleanly");
    Ok(())
}
