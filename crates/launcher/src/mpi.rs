use async_trait::async_trait;

use kluster_core::MpiConfig;

use crate::error::LauncherError;
use crate::process::{LocalProcessLauncher, ProcessSpec};
use crate::state::{Lifecycle, StartData};
use crate::traits::{Launcher, Signal};

/// Runs `program` under `mpiexec -n N`.
///
/// One mpiexec process stands for the whole set, so stop and signal act on it.
#[derive(Clone)]
pub struct MpiLauncher {
    process: LocalProcessLauncher,
    mpi: MpiConfig,
    program: Vec<String>,
}

impl MpiLauncher {
    pub fn new(name: impl Into<String>, mpi: MpiConfig, program: Vec<String>, spec: ProcessSpec) -> Self {
        Self {
            process: LocalProcessLauncher::new(name, spec),
            mpi,
            program,
        }
    }

    pub fn command(&self, n: usize) -> Vec<String> {
        let mut argv = self.mpi.cmd.clone();
        argv.push("-n".into());
        argv.push(n.to_string());
        argv.extend(self.mpi.args.iter().cloned());
        argv.extend(self.program.iter().cloned());
        argv
    }
}

#[async_trait]
impl Launcher for MpiLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        self.process.lifecycle()
    }

    async fn start(&self, n: usize) -> Result<StartData, LauncherError> {
        self.process.set_command(self.command(n));
        self.process.start(1).await
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        self.process.stop().await
    }

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.process.signal(sig).await
    }
}
