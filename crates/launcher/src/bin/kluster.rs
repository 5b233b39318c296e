//! kluster: start, grow, and stop a cluster.
//!
//! `start` launches the controller, waits `launcher.delay_secs`, then launches
//! the engines, and keeps running until interrupted. `engines` adds engines to
//! a running cluster. `stop` signals the `start` process through its pid file.
//!
//! # Usage
//!
//! ```bash
//! kluster start -n 4
//! kluster --config kluster.toml start --engines Slurm
//! kluster engines -n 2 --profile-dir ~/.kluster/profile_default
//! kluster stop --signal TERM
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tokio::time::Instant;

use kluster_core::ClusterConfig;
use kluster_launcher::process::send_signal;
use kluster_launcher::{
    controller_launcher, engine_launcher, exit_codes, ClusterIdentity, ClusterLauncher, Launcher,
    PidFile, Signal, StopData,
};

#[derive(Parser, Debug)]
#[command(name = "kluster", version, about)]
struct Cli {
    /// Path to kluster.toml (default: <profile-dir>/kluster.toml if present).
    #[arg(long, global = true, env = "KLUSTER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    profile_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    cluster_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a controller and engines.
    Start {
        /// Number of engines.
        #[arg(short, long)]
        n: Option<usize>,

        /// Controller launcher kind.
        #[arg(long)]
        controller: Option<String>,

        /// Engine launcher kind.
        #[arg(long)]
        engines: Option<String>,
    },
    /// Start engines for a running cluster.
    Engines {
        #[arg(short, long)]
        n: Option<usize>,

        #[arg(long)]
        engines: Option<String>,
    },
    /// Stop a running cluster.
    Stop {
        #[arg(long, default_value = "INT")]
        signal: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    kluster_core::profile::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ClusterConfig::discover(cli.config.as_deref(), cli.profile_dir.as_deref())?;
    if let Some(id) = &cli.cluster_id {
        config.cluster.cluster_id = id.clone();
    }

    match cli.command {
        Command::Start { n, controller, engines } => {
            if let Some(kind) = controller {
                config.launcher.controller = kind;
            }
            if let Some(kind) = engines {
                config.launcher.engines = kind;
            }
            let n = n.unwrap_or(config.launcher.n);
            start(config, n).await
        }
        Command::Engines { n, engines } => {
            if let Some(kind) = engines {
                config.launcher.engines = kind;
            }
            let n = n.unwrap_or(config.launcher.n);
            engines_only(config, n).await
        }
        Command::Stop { signal } => stop(config, Signal::parse(&signal)?).await,
    }
}

// ── start ────────────────────────────────────────────────────────────

async fn start(config: ClusterConfig, n: usize) -> anyhow::Result<ExitCode> {
    let identity = ClusterIdentity::from_config(&config);
    identity.profile().ensure()?;
    let pid_file = PidFile::for_cluster(&identity);
    if let Some(pid) = pid_file.live_pid() {
        tracing::error!(pid, path = %pid_file.path().display(), "cluster already running");
        return Ok(ExitCode::from(exit_codes::ALREADY_STARTED as u8));
    }
    pid_file.write(std::process::id())?;

    let result = run_cluster(&config, n).await;
    pid_file.remove()?;
    result
}

async fn run_cluster(config: &ClusterConfig, n: usize) -> anyhow::Result<ExitCode> {
    let controller = controller_launcher(config)?;
    let engines = engine_launcher(config)?;
    let stopping = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    {
        let stopping = Arc::clone(&stopping);
        let shutdown = Arc::clone(&shutdown);
        controller.on_stop(Box::new(move |data| {
            if !stopping.load(Ordering::SeqCst) {
                tracing::error!(data = ?data, "controller stopped unexpectedly");
                shutdown.notify_one();
            }
        }));
    }

    tracing::info!(kind = %config.launcher.controller, "starting controller");
    controller.start(1).await?;

    tokio::select! {
        _ = tokio::time::sleep(config.launcher.delay()) => {}
        _ = shutdown.notified() => {
            stop_all(&controller, &engines, config.launcher.kill_delay()).await;
            return Ok(ExitCode::FAILURE);
        }
        res = shutdown_signal() => {
            res?;
            stopping.store(true, Ordering::SeqCst);
            stop_all(&controller, &engines, config.launcher.kill_delay()).await;
            return Ok(ExitCode::SUCCESS);
        }
    }

    {
        let stopping = Arc::clone(&stopping);
        let shutdown = Arc::clone(&shutdown);
        let started_at = Instant::now();
        let early = config.launcher.early_shutdown();
        engines.on_stop(Box::new(move |data| {
            if stopping.load(Ordering::SeqCst) {
                return;
            }
            if started_at.elapsed() < early {
                tracing::error!(
                    data = ?data,
                    window_secs = early.as_secs_f64(),
                    "engines shut down early, stopping cluster"
                );
                shutdown.notify_one();
            } else {
                tracing::warn!(data = ?data, "engines stopped");
            }
        }));
    }

    tracing::info!(kind = %config.launcher.engines, n, "starting engines");
    if let Err(e) = engines.start(n).await {
        tracing::error!(error = %e, "engines failed to start");
        stopping.store(true, Ordering::SeqCst);
        stop_all(&controller, &engines, config.launcher.kill_delay()).await;
        return Ok(ExitCode::FAILURE);
    }
    tracing::info!("cluster running, press Ctrl+C to stop");

    let code = tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown signal received, stopping cluster");
            ExitCode::SUCCESS
        }
        _ = shutdown.notified() => ExitCode::FAILURE,
    };
    stopping.store(true, Ordering::SeqCst);
    stop_all(&controller, &engines, config.launcher.kill_delay()).await;
    Ok(code)
}

/// Stop engines then the controller and wait for both, bounded by the kill
/// escalation plus a grace period.
async fn stop_all(controller: &ClusterLauncher, engines: &ClusterLauncher, kill_delay: Duration) {
    for launcher in [engines, controller] {
        if let Err(e) = launcher.stop().await {
            tracing::warn!(launcher = %launcher.name(), error = %e, "stop failed");
        }
    }
    let wait = kill_delay + Duration::from_secs(5);
    for launcher in [engines, controller] {
        if launcher.state() != kluster_launcher::LaunchState::Running {
            continue;
        }
        match tokio::time::timeout(wait, launcher.lifecycle().stopped()).await {
            Ok(data) => log_stop(launcher.name(), &data),
            Err(_) => tracing::warn!(launcher = %launcher.name(), "did not stop in time"),
        }
    }
}

fn log_stop(name: &str, data: &StopData) {
    if data.is_success() {
        tracing::info!(launcher = %name, "stopped cleanly");
    } else {
        tracing::warn!(launcher = %name, data = ?data, "stopped");
    }
}

// ── engines ──────────────────────────────────────────────────────────

async fn engines_only(config: ClusterConfig, n: usize) -> anyhow::Result<ExitCode> {
    let identity = ClusterIdentity::from_config(&config);
    let connection = identity
        .profile()
        .connection_file(&identity.cluster_id, "engine");
    if PidFile::for_cluster(&identity).live_pid().is_none() && !connection.is_file() {
        tracing::error!(
            path = %connection.display(),
            "no running cluster: no live pid file and no engine connection file"
        );
        return Ok(ExitCode::from(exit_codes::NO_CLUSTER as u8));
    }

    let engines = engine_launcher(&config)?;
    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        engines.on_stop(Box::new(move |_| shutdown.notify_one()));
    }
    engines.start(n).await?;

    tokio::select! {
        res = shutdown_signal() => {
            res?;
            if let Err(e) = engines.stop().await {
                tracing::warn!(error = %e, "stop failed");
            }
            let wait = config.launcher.kill_delay() + Duration::from_secs(5);
            if let Ok(data) = tokio::time::timeout(wait, engines.lifecycle().stopped()).await {
                log_stop(engines.name(), &data);
            }
            Ok(ExitCode::SUCCESS)
        }
        _ = shutdown.notified() => {
            let ok = engines.stop_data().map(|d| d.is_success()).unwrap_or(false);
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

// ── stop ─────────────────────────────────────────────────────────────

async fn stop(config: ClusterConfig, signal: Signal) -> anyhow::Result<ExitCode> {
    let identity = ClusterIdentity::from_config(&config);
    let pid_file = PidFile::for_cluster(&identity);
    let Some(pid) = pid_file.read() else {
        tracing::error!(path = %pid_file.path().display(), "cluster already stopped (no pid file)");
        return Ok(ExitCode::from(exit_codes::ALREADY_STOPPED as u8));
    };
    if pid_file.live_pid().is_none() {
        tracing::error!(pid, "cluster already stopped (stale pid file removed)");
        return Ok(ExitCode::from(exit_codes::ALREADY_STOPPED as u8));
    }
    send_signal(pid, signal).await?;
    tracing::info!(pid, signal = %signal, "stopping cluster");
    Ok(ExitCode::SUCCESS)
}

// ── Signal handling ──────────────────────────────────────────────────

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
