//! Launcher selection: config names map onto a closed set of kinds, and each
//! kind builds a [`ClusterLauncher`] for the controller or the engines.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use kluster_core::{ClusterConfig, LauncherConfig};

use crate::batch::{BatchLauncher, BatchSettings, BatchSystem};
use crate::cluster::{ClusterIdentity, Role, RoleCommand};
use crate::engine_set::{ChildLauncher, ChildPlan, EngineSetLauncher};
use crate::error::LauncherError;
use crate::mpi::MpiLauncher;
use crate::process::{LocalProcessLauncher, ProcessSpec};
use crate::ssh::{remote_profile_dir, RemoteProgram, SshLauncher, SshSettings, SshTarget};
use crate::state::{Lifecycle, StartData};
use crate::traits::{Launcher, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LauncherKind {
    Local,
    Mpi,
    Ssh,
    SshProxy,
    WindowsHpc,
    Pbs,
    Slurm,
    Sge,
    Lsf,
    HtCondor,
}

impl LauncherKind {
    pub fn batch_system(self) -> Option<BatchSystem> {
        match self {
            Self::WindowsHpc => Some(BatchSystem::WindowsHpc),
            Self::Pbs => Some(BatchSystem::Pbs),
            Self::Slurm => Some(BatchSystem::Slurm),
            Self::Sge => Some(BatchSystem::Sge),
            Self::Lsf => Some(BatchSystem::Lsf),
            Self::HtCondor => Some(BatchSystem::HtCondor),
            _ => None,
        }
    }
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "Local",
            Self::Mpi => "MPI",
            Self::Ssh => "SSH",
            Self::SshProxy => "SSHProxy",
            Self::WindowsHpc => "WindowsHPC",
            Self::Pbs => "PBS",
            Self::Slurm => "Slurm",
            Self::Sge => "SGE",
            Self::Lsf => "LSF",
            Self::HtCondor => "HTCondor",
        })
    }
}

impl FromStr for LauncherKind {
    type Err = LauncherError;

    /// Accepts short names (`slurm`) and long ones
    /// (`SlurmEngineSetLauncher`, `kluster.launcher.PBSControllerLauncher`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.rsplit('.').next().unwrap_or(s).to_ascii_lowercase();
        let mut key = base.as_str();
        for suffix in ["enginesetlauncher", "controllerlauncher", "launcher"] {
            if let Some(stripped) = key.strip_suffix(suffix) {
                key = stripped;
                break;
            }
        }
        match key {
            "local" => Ok(Self::Local),
            "mpi" | "mpiexec" => Ok(Self::Mpi),
            "ssh" => Ok(Self::Ssh),
            "sshproxy" => Ok(Self::SshProxy),
            "windowshpc" | "winhpc" => Ok(Self::WindowsHpc),
            "pbs" => Ok(Self::Pbs),
            "slurm" => Ok(Self::Slurm),
            "sge" => Ok(Self::Sge),
            "lsf" => Ok(Self::Lsf),
            "htcondor" | "condor" => Ok(Self::HtCondor),
            _ => Err(LauncherError::UnknownLauncher(s.to_string())),
        }
    }
}

/// Any launcher the cluster can run.
#[derive(Clone)]
pub enum ClusterLauncher {
    Process(LocalProcessLauncher),
    Mpi(MpiLauncher),
    Ssh(SshLauncher),
    EngineSet(EngineSetLauncher),
    Batch(BatchLauncher),
}

impl ClusterLauncher {
    fn as_dyn(&self) -> &dyn Launcher {
        match self {
            Self::Process(l) => l,
            Self::Mpi(l) => l,
            Self::Ssh(l) => l,
            Self::EngineSet(l) => l,
            Self::Batch(l) => l,
        }
    }
}

#[async_trait]
impl Launcher for ClusterLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        self.as_dyn().lifecycle()
    }

    async fn start(&self, n: usize) -> Result<StartData, LauncherError> {
        self.as_dyn().start(n).await
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        self.as_dyn().stop().await
    }

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.as_dyn().signal(sig).await
    }
}

fn process_spec(launcher: &LauncherConfig, argv: Vec<String>) -> ProcessSpec {
    ProcessSpec {
        argv,
        work_dir: launcher.work_dir.clone(),
        env: Default::default(),
        poll_interval: launcher.poll_interval(),
        kill_delay: launcher.kill_delay(),
    }
}

fn batch_work_dir(config: &ClusterConfig, identity: &ClusterIdentity) -> PathBuf {
    config
        .launcher
        .work_dir
        .clone()
        .unwrap_or_else(|| identity.profile().log_dir())
}

fn remote_profile(config: &ClusterConfig, identity: &ClusterIdentity) -> String {
    match &config.launcher.ssh.remote_profile_dir {
        Some(dir) => dir.display().to_string(),
        None => remote_profile_dir(&identity.profile_dir),
    }
}

fn remote_identity_args(profile: &str) -> Vec<String> {
    vec!["--profile-dir".to_string(), profile.to_string()]
}

fn reject_cluster_id(identity: &ClusterIdentity, kind: LauncherKind) -> Result<(), LauncherError> {
    if identity.cluster_id.is_empty() {
        Ok(())
    } else {
        Err(LauncherError::Config(format!(
            "{kind} launchers do not support cluster ids (got '{}')",
            identity.cluster_id
        )))
    }
}

fn connection_file_name(identity: &ClusterIdentity, side: &str) -> Result<String, LauncherError> {
    identity
        .profile()
        .connection_file(&identity.cluster_id, side)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| LauncherError::Config("connection file has no name".into()))
}

fn batch(config: &ClusterConfig, system: BatchSystem, role: Role) -> ClusterLauncher {
    let identity = ClusterIdentity::from_config(config);
    ClusterLauncher::Batch(BatchLauncher::new(BatchSettings {
        system,
        role,
        config: config.launcher.batch.clone(),
        command: RoleCommand::from_config(role, &config.launcher),
        work_dir: batch_work_dir(config, &identity),
        identity,
    }))
}

/// Build the launcher for the controller process.
pub fn controller_launcher(config: &ClusterConfig) -> Result<ClusterLauncher, LauncherError> {
    let kind: LauncherKind = config.launcher.controller.parse()?;
    let identity = ClusterIdentity::from_config(config);
    let command = RoleCommand::from_config(Role::Controller, &config.launcher);
    debug!(kind = %kind, "building controller launcher");

    if let Some(system) = kind.batch_system() {
        return Ok(batch(config, system, Role::Controller));
    }
    match kind {
        LauncherKind::Local => Ok(ClusterLauncher::Process(LocalProcessLauncher::new(
            "controller",
            process_spec(&config.launcher, command.argv(&identity)),
        ))),
        LauncherKind::Mpi => Ok(ClusterLauncher::Mpi(MpiLauncher::new(
            "controller",
            config.launcher.mpi.clone(),
            command.argv(&identity),
            process_spec(&config.launcher, Vec::new()),
        ))),
        LauncherKind::Ssh => {
            reject_cluster_id(&identity, kind)?;
            let ssh = &config.launcher.ssh;
            let host = ssh.hostname.clone().ok_or_else(|| {
                LauncherError::Config("SSH controller launcher needs launcher.ssh.hostname".into())
            })?;
            let target = SshTarget::new(host, ssh.user.clone());
            let remote = remote_profile(config, &identity);
            let program = command.argv_with(&remote_identity_args(&remote));
            let mut launcher = SshLauncher::new(
                "controller",
                target,
                SshSettings::from(ssh),
                RemoteProgram::Fixed(program),
                process_spec(&config.launcher, Vec::new()),
            );
            for side in ["client", "engine"] {
                let file = connection_file_name(&identity, side)?;
                launcher = launcher.fetching(
                    format!("{remote}/security/{file}"),
                    identity.profile().connection_file(&identity.cluster_id, side),
                );
            }
            Ok(ClusterLauncher::Ssh(launcher))
        }
        other => Err(LauncherError::Config(format!(
            "{other} cannot launch a controller"
        ))),
    }
}

/// Build the launcher for the engine set.
pub fn engine_launcher(config: &ClusterConfig) -> Result<ClusterLauncher, LauncherError> {
    let kind: LauncherKind = config.launcher.engines.parse()?;
    let identity = ClusterIdentity::from_config(config);
    let command = RoleCommand::from_config(Role::Engine, &config.launcher);
    debug!(kind = %kind, "building engine launcher");

    if let Some(system) = kind.batch_system() {
        return Ok(batch(config, system, Role::Engine));
    }
    match kind {
        LauncherKind::Local => {
            let launcher = config.launcher.clone();
            let argv = command.argv(&identity);
            let plan: ChildPlan = Box::new(move |n| {
                Ok((0..n)
                    .map(|i| {
                        let child: ChildLauncher = Arc::new(LocalProcessLauncher::new(
                            format!("engine-{i}"),
                            process_spec(&launcher, argv.clone()),
                        ));
                        (i.to_string(), child)
                    })
                    .collect())
            });
            Ok(ClusterLauncher::EngineSet(EngineSetLauncher::new(
                "engines",
                plan,
                config.launcher.stagger(),
            )))
        }
        LauncherKind::Mpi => Ok(ClusterLauncher::Mpi(MpiLauncher::new(
            "engines",
            config.launcher.mpi.clone(),
            command.argv(&identity),
            process_spec(&config.launcher, Vec::new()),
        ))),
        LauncherKind::Ssh => {
            reject_cluster_id(&identity, kind)?;
            let children = ssh_engine_children(config, &identity, &command)?;
            let plan: ChildPlan = Box::new(move |_| Ok(children.clone()));
            Ok(ClusterLauncher::EngineSet(EngineSetLauncher::new(
                "engines",
                plan,
                config.launcher.stagger(),
            )))
        }
        LauncherKind::SshProxy => {
            reject_cluster_id(&identity, kind)?;
            let ssh = &config.launcher.ssh;
            let host = ssh.hostname.clone().ok_or_else(|| {
                LauncherError::Config("SSH proxy launcher needs launcher.ssh.hostname".into())
            })?;
            let remote = remote_profile(config, &identity);
            let file = connection_file_name(&identity, "engine")?;
            let launcher = SshLauncher::new(
                "engines",
                SshTarget::new(host, ssh.user.clone()),
                SshSettings::from(ssh),
                RemoteProgram::Proxy {
                    cmd: ssh.proxy_cmd.clone(),
                    profile_dir: remote.clone(),
                },
                process_spec(&config.launcher, Vec::new()),
            )
            .sending(
                identity.profile().connection_file(&identity.cluster_id, "engine"),
                format!("{remote}/security/{file}"),
            );
            Ok(ClusterLauncher::Ssh(launcher))
        }
        other => Err(LauncherError::Config(format!("{other} cannot launch engines"))),
    }
}

/// One ssh launcher per engine, grouped by host. Only the first engine on a
/// host copies the connection file over.
fn ssh_engine_children(
    config: &ClusterConfig,
    identity: &ClusterIdentity,
    command: &RoleCommand,
) -> Result<Vec<(String, ChildLauncher)>, LauncherError> {
    let ssh = &config.launcher.ssh;
    if ssh.engines.is_empty() {
        return Err(LauncherError::Config(
            "SSH engine launcher needs at least one entry in launcher.ssh.engines".into(),
        ));
    }
    let remote = remote_profile(config, identity);
    let file = connection_file_name(identity, "engine")?;
    let local_file = identity.profile().connection_file(&identity.cluster_id, "engine");

    let mut children = Vec::new();
    for (host, spec) in &ssh.engines {
        let target: SshTarget = host.parse()?;
        let host_command = RoleCommand {
            role: Role::Engine,
            cmd: spec.engine_cmd().map(<[String]>::to_vec).unwrap_or_else(|| command.cmd.clone()),
            args: spec.engine_args().map(<[String]>::to_vec).unwrap_or_else(|| command.args.clone()),
        };
        let program = host_command.argv_with(&remote_identity_args(&remote));
        for i in 0..spec.count() {
            let key = format!("{host}/{i}");
            let mut launcher = SshLauncher::new(
                format!("engine-{key}"),
                target.clone(),
                SshSettings::from(ssh),
                RemoteProgram::Fixed(program.clone()),
                process_spec(&config.launcher, Vec::new()),
            );
            if i == 0 {
                launcher = launcher.sending(local_file.clone(), format!("{remote}/security/{file}"));
            }
            let child: ChildLauncher = Arc::new(launcher);
            children.push((key, child));
        }
    }
    Ok(children)
}
