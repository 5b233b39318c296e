//! What every launcher needs to know about the cluster it belongs to.

use std::fmt;
use std::path::{Path, PathBuf};

use kluster_core::{ClusterConfig, LauncherConfig, ProfileDir};
use tracing::{debug, warn};

use crate::error::LauncherError;
use crate::process::process_alive;

/// Exit codes of the `kluster` binary.
pub mod exit_codes {
    pub const ALREADY_STARTED: i32 = 10;
    pub const ALREADY_STOPPED: i32 = 11;
    pub const NO_CLUSTER: i32 = 12;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Engine,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Engine => "engine",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile directory plus cluster id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub profile_dir: PathBuf,
    pub cluster_id: String,
}

impl ClusterIdentity {
    pub fn new(profile_dir: impl Into<PathBuf>, cluster_id: impl Into<String>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            cluster_id: cluster_id.into(),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.cluster.profile_dir.clone(), config.cluster.cluster_id.clone())
    }

    pub fn profile(&self) -> ProfileDir {
        ProfileDir::new(&self.profile_dir)
    }

    /// Arguments that point a kluster binary at this cluster.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--profile-dir".to_string(),
            self.profile_dir.display().to_string(),
        ];
        if !self.cluster_id.is_empty() {
            args.push("--cluster-id".into());
            args.push(self.cluster_id.clone());
        }
        args
    }
}

/// Command and arguments for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCommand {
    pub role: Role,
    pub cmd: Vec<String>,
    pub args: Vec<String>,
}

impl RoleCommand {
    pub fn from_config(role: Role, launcher: &LauncherConfig) -> Self {
        let (cmd, args) = match role {
            Role::Controller => (&launcher.controller_cmd, &launcher.controller_args),
            Role::Engine => (&launcher.engine_cmd, &launcher.engine_args),
        };
        Self {
            role,
            cmd: cmd.clone(),
            args: args.clone(),
        }
    }

    /// Full argv with the cluster identity appended.
    pub fn argv(&self, identity: &ClusterIdentity) -> Vec<String> {
        self.argv_with(&identity.args())
    }

    pub fn argv_with(&self, identity_args: &[String]) -> Vec<String> {
        let mut argv = self.cmd.clone();
        argv.extend(self.args.iter().cloned());
        argv.extend(identity_args.iter().cloned());
        argv
    }
}

/// Pid file of a running `kluster start`.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn for_cluster(identity: &ClusterIdentity) -> Self {
        Self {
            path: identity.profile().pid_file(&identity.cluster_id),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<u32> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match text.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!(path = %self.path.display(), "pid file does not contain a pid");
                None
            }
        }
    }

    /// Pid of a live process recorded in the file. Stale files are removed.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            debug!(pid, path = %self.path.display(), "removing stale pid file");
            let _ = std::fs::remove_file(&self.path);
            None
        }
    }

    pub fn write(&self, pid: u32) -> Result<(), LauncherError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, pid.to_string())?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), LauncherError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_args_skip_empty_cluster_id() {
        let id = ClusterIdentity::new("/p", "");
        assert_eq!(id.args(), vec!["--profile-dir", "/p"]);
        let id = ClusterIdentity::new("/p", "c1");
        assert_eq!(id.args(), vec!["--profile-dir", "/p", "--cluster-id", "c1"]);
    }

    #[test]
    fn role_command_appends_identity() {
        let cfg = LauncherConfig {
            engine_args: vec!["--quiet".into()],
            ..LauncherConfig::default()
        };
        let cmd = RoleCommand::from_config(Role::Engine, &cfg);
        let argv = cmd.argv(&ClusterIdentity::new("/p", ""));
        assert_eq!(argv, vec!["kluster-engine", "--quiet", "--profile-dir", "/p"]);
    }

    #[test]
    fn pid_file_roundtrip_and_stale_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::for_cluster(&ClusterIdentity::new(dir.path(), "x"));
        assert!(pid_file.path().ends_with("pid/kluster-x.pid"));
        assert_eq!(pid_file.read(), None);

        pid_file.write(std::process::id()).unwrap();
        assert_eq!(pid_file.live_pid(), Some(std::process::id()));

        pid_file.remove().unwrap();
        pid_file.remove().unwrap();
        assert!(!pid_file.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_is_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::at(dir.path().join("k.pid"));
        // pid_max on linux is at most 2^22
        pid_file.write(4_194_304 + 7).unwrap();
        assert_eq!(pid_file.live_pid(), None);
        assert!(!pid_file.path().exists());
    }
}
