//! Process supervision for kluster controllers and engines.
//!
//! Every backend implements [`Launcher`] on top of a shared [`Lifecycle`]:
//! local processes, `mpiexec`, ssh sessions (plain and proxied), engine sets
//! and batch schedulers (PBS, Slurm, SGE, LSF, HTCondor, Windows HPC).
//! [`kind::controller_launcher`] and [`kind::engine_launcher`] turn a
//! [`kluster_core::ClusterConfig`] into a ready-to-start [`ClusterLauncher`].

pub mod batch;
pub mod cluster;
pub mod engine_set;
pub mod error;
pub mod kind;
pub mod mpi;
pub mod process;
pub mod ssh;
pub mod state;
pub mod traits;

pub use batch::{BatchLauncher, BatchSystem};
pub use cluster::{exit_codes, ClusterIdentity, PidFile, Role, RoleCommand};
pub use engine_set::EngineSetLauncher;
pub use error::LauncherError;
pub use kind::{controller_launcher, engine_launcher, ClusterLauncher, LauncherKind};
pub use mpi::MpiLauncher;
pub use process::{LocalProcessLauncher, ProcessSpec};
pub use ssh::SshLauncher;
pub use state::{LaunchState, Lifecycle, StartData, StopCallback, StopData};
pub use traits::{Launcher, Signal};
