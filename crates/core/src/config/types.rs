use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::profile::default_profile_dir;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for a kluster deployment.
///
/// One file drives both the controller process and the cluster launcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,
}

// ── Section configs ─────────────────────────────────────────────────

/// Which cluster this is: the profile directory plus an optional id that
/// lets several clusters share one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,

    #[serde(default)]
    pub cluster_id: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            profile_dir: default_profile_dir(),
            cluster_id: String::new(),
        }
    }
}

/// Socket addressing for every controller channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// "tcp" or "ipc".
    #[serde(default = "default_transport_kind")]
    pub kind: String,

    /// Interface the controller binds on.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Address advertised to engines and clients (defaults to `ip`).
    #[serde(default)]
    pub location: Option<String>,

    /// First port of the contiguous block the controller allocates from.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// SSH server clients should tunnel through, recorded in connection files.
    #[serde(default)]
    pub ssh: Option<String>,
}

fn default_transport_kind() -> String {
    "tcp".into()
}

fn default_ip() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    10100
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            ip: default_ip(),
            location: None,
            base_port: default_base_port(),
            ssh: None,
        }
    }
}

impl TransportConfig {
    pub fn advertised_location(&self) -> &str {
        self.location.as_deref().unwrap_or(&self.ip)
    }
}

/// Controller (hub + schedulers) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Task scheme: "leastload", "lru", "pure" or "none".
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Maximum outstanding tasks per engine (0 = unlimited).
    #[serde(default = "default_hwm")]
    pub hwm: u32,

    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,

    /// Consecutive missed beats before an engine is declared dead.
    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,

    /// How long a registered engine may stay silent before its first beat.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,

    /// Depth of the broadcast scheduler tree (root only = 0).
    #[serde(default = "default_broadcast_depth")]
    pub broadcast_depth: u32,

    /// Expected number of engines; sizes the broadcast slot table.
    #[serde(default = "default_broadcast_slots")]
    pub broadcast_slots: usize,

    /// Per-target deadline for broadcast replies.
    #[serde(default = "default_broadcast_timeout_secs")]
    pub broadcast_timeout_secs: f64,

    /// Task record backend: "nodb", "memory" or "file".
    #[serde(default = "default_db")]
    pub db: String,

    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Load existing connection files and keep them on exit.
    #[serde(default)]
    pub reuse_files: bool,

    /// Reload the engine table written by a previous controller.
    #[serde(default)]
    pub restore_engines: bool,

    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
}

fn default_scheme() -> String {
    "leastload".into()
}

fn default_hwm() -> u32 {
    1
}

fn default_heartbeat_period_ms() -> u64 {
    3000
}

fn default_heartbeat_max_missed() -> u32 {
    10
}

fn default_registration_timeout_ms() -> u64 {
    15_000
}

fn default_broadcast_depth() -> u32 {
    1
}

fn default_broadcast_slots() -> usize {
    64
}

fn default_broadcast_timeout_secs() -> f64 {
    30.0
}

fn default_db() -> String {
    "nodb".into()
}

fn default_signature_scheme() -> String {
    "none".into()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            hwm: default_hwm(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            heartbeat_max_missed: default_heartbeat_max_missed(),
            registration_timeout_ms: default_registration_timeout_ms(),
            broadcast_depth: default_broadcast_depth(),
            broadcast_slots: default_broadcast_slots(),
            broadcast_timeout_secs: default_broadcast_timeout_secs(),
            db: default_db(),
            db_path: None,
            reuse_files: false,
            restore_engines: false,
            signature_scheme: default_signature_scheme(),
        }
    }
}

impl ControllerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.broadcast_timeout_secs)
    }
}

/// Launcher selection and per-backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Controller launcher kind, e.g. "Local", "Slurm".
    #[serde(default = "default_launcher_kind")]
    pub controller: String,

    /// Engine set launcher kind, e.g. "Local", "MPI", "SSH".
    #[serde(default = "default_launcher_kind")]
    pub engines: String,

    /// Number of engines to start.
    #[serde(default = "default_n")]
    pub n: usize,

    /// Pause between controller start and engine start.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,

    /// Pause between consecutive engine starts inside a local engine set.
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: f64,

    /// Grace period between interrupt and kill on stop.
    #[serde(default = "default_kill_delay_secs")]
    pub kill_delay_secs: f64,

    /// Engines stopping within this window of start shut the cluster down.
    #[serde(default = "default_early_shutdown_secs")]
    pub early_shutdown_secs: f64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    #[serde(default = "default_controller_cmd")]
    pub controller_cmd: Vec<String>,

    #[serde(default)]
    pub controller_args: Vec<String>,

    #[serde(default = "default_engine_cmd")]
    pub engine_cmd: Vec<String>,

    #[serde(default)]
    pub engine_args: Vec<String>,

    #[serde(default)]
    pub mpi: MpiConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

fn default_launcher_kind() -> String {
    "Local".into()
}

fn default_n() -> usize {
    2
}

fn default_delay_secs() -> f64 {
    1.0
}

fn default_stagger_secs() -> f64 {
    0.1
}

fn default_kill_delay_secs() -> f64 {
    2.0
}

fn default_early_shutdown_secs() -> f64 {
    30.0
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_controller_cmd() -> Vec<String> {
    vec!["kluster-controller".into()]
}

fn default_engine_cmd() -> Vec<String> {
    vec!["kluster-engine".into()]
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            controller: default_launcher_kind(),
            engines: default_launcher_kind(),
            n: default_n(),
            delay_secs: default_delay_secs(),
            stagger_secs: default_stagger_secs(),
            kill_delay_secs: default_kill_delay_secs(),
            early_shutdown_secs: default_early_shutdown_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            work_dir: None,
            controller_cmd: default_controller_cmd(),
            controller_args: Vec::new(),
            engine_cmd: default_engine_cmd(),
            engine_args: Vec::new(),
            mpi: MpiConfig::default(),
            ssh: SshConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl LauncherConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_secs_f64(self.stagger_secs)
    }

    pub fn kill_delay(&self) -> Duration {
        Duration::from_secs_f64(self.kill_delay_secs)
    }

    pub fn early_shutdown(&self) -> Duration {
        Duration::from_secs_f64(self.early_shutdown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiConfig {
    #[serde(default = "default_mpi_cmd")]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_mpi_cmd() -> Vec<String> {
    vec!["mpiexec".into()]
}

impl Default for MpiConfig {
    fn default() -> Self {
        Self {
            cmd: default_mpi_cmd(),
            args: Vec::new(),
        }
    }
}

/// SSH launcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_cmd")]
    pub cmd: Vec<String>,

    #[serde(default = "default_ssh_args")]
    pub args: Vec<String>,

    #[serde(default = "default_scp_cmd")]
    pub scp_cmd: Vec<String>,

    /// Host the controller runs on (SSH controller launcher).
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    /// Profile dir on the remote side; defaults to the local one relative to home.
    #[serde(default)]
    pub remote_profile_dir: Option<PathBuf>,

    /// Engines per host: `"user@host:port" = 4` or a detailed table.
    #[serde(default)]
    pub engines: BTreeMap<String, SshEngineSpec>,

    /// Remote command used by the SSH proxy launcher.
    #[serde(default = "default_proxy_cmd")]
    pub proxy_cmd: Vec<String>,
}

fn default_ssh_cmd() -> Vec<String> {
    vec!["ssh".into()]
}

fn default_ssh_args() -> Vec<String> {
    vec!["-tt".into()]
}

fn default_scp_cmd() -> Vec<String> {
    vec!["scp".into()]
}

fn default_proxy_cmd() -> Vec<String> {
    vec!["kluster".into()]
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            cmd: default_ssh_cmd(),
            args: default_ssh_args(),
            scp_cmd: default_scp_cmd(),
            hostname: None,
            user: None,
            remote_profile_dir: None,
            engines: BTreeMap::new(),
            proxy_cmd: default_proxy_cmd(),
        }
    }
}

/// Engines to start on one SSH host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SshEngineSpec {
    Count(usize),
    WithArgs(usize, Vec<String>),
    Detailed {
        n: usize,
        #[serde(default)]
        engine_args: Option<Vec<String>>,
        #[serde(default)]
        engine_cmd: Option<Vec<String>>,
    },
}

impl SshEngineSpec {
    pub fn count(&self) -> usize {
        match self {
            Self::Count(n) | Self::WithArgs(n, _) | Self::Detailed { n, .. } => *n,
        }
    }

    pub fn engine_args(&self) -> Option<&[String]> {
        match self {
            Self::Count(_) => None,
            Self::WithArgs(_, args) => Some(args),
            Self::Detailed { engine_args, .. } => engine_args.as_deref(),
        }
    }

    pub fn engine_cmd(&self) -> Option<&[String]> {
        match self {
            Self::Detailed { engine_cmd, .. } => engine_cmd.as_deref(),
            _ => None,
        }
    }
}

/// Batch system settings shared by PBS, Slurm, SGE, LSF, HTCondor and Windows HPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub qos: Option<String>,

    #[serde(default)]
    pub timelimit: Option<String>,

    /// Extra directive text inserted after the first line.
    #[serde(default)]
    pub options: Option<String>,

    #[serde(default)]
    pub controller_template: Option<String>,

    #[serde(default)]
    pub controller_template_file: Option<PathBuf>,

    #[serde(default)]
    pub engine_template: Option<String>,

    #[serde(default)]
    pub engine_template_file: Option<PathBuf>,

    /// Extra template variables.
    #[serde(default)]
    pub namespace: BTreeMap<String, String>,

    #[serde(default)]
    pub submit_command: Option<Vec<String>>,

    #[serde(default)]
    pub delete_command: Option<Vec<String>>,

    #[serde(default)]
    pub job_id_regexp: Option<String>,

    /// Head node for Windows HPC.
    #[serde(default)]
    pub scheduler: Option<String>,
}
