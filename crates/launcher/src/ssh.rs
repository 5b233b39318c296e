//! Launching over ssh.
//!
//! The remote command runs under `ssh -tt` so closing the session tears it
//! down. Files are copied with scp: connection files go out before an engine
//! starts and come back after a remote controller has written them.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use kluster_core::SshConfig;

use crate::error::LauncherError;
use crate::process::{run_checked, run_command, LocalProcessLauncher, ProcessSpec};
use crate::state::{Lifecycle, StartData};
use crate::traits::{interrupt_then_kill, Launcher, Signal};

/// `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: Option<String>) -> Self {
        Self {
            user,
            host: host.into(),
            port: None,
        }
    }

    /// Destination argument for ssh and scp.
    pub fn location(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_port_args(&self) -> Vec<String> {
        self.port
            .map(|p| vec!["-p".to_string(), p.to_string()])
            .unwrap_or_default()
    }

    fn scp_port_args(&self) -> Vec<String> {
        self.port
            .map(|p| vec!["-P".to_string(), p.to_string()])
            .unwrap_or_default()
    }
}

impl FromStr for SshTarget {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, rest) = match s.split_once('@') {
            Some((u, r)) if !u.is_empty() => (Some(u.to_string()), r),
            Some(_) => return Err(LauncherError::Config(format!("empty user in ssh host '{s}'"))),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| LauncherError::Config(format!("invalid ssh port in '{s}'")))?;
                (h, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() {
            return Err(LauncherError::Config(format!("empty host in '{s}'")));
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Profile dir to use on the remote side: the local one relative to `$HOME`.
pub fn remote_profile_dir(local: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(rel) = local.strip_prefix(&home) {
            return rel.display().to_string();
        }
    }
    local.display().to_string()
}

/// ssh and scp invocations.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub ssh_cmd: Vec<String>,
    pub ssh_args: Vec<String>,
    pub scp_cmd: Vec<String>,
    /// How long to wait for a file to appear before copying it.
    pub transfer_timeout: Duration,
}

impl From<&SshConfig> for SshSettings {
    fn from(cfg: &SshConfig) -> Self {
        Self {
            ssh_cmd: cfg.cmd.clone(),
            ssh_args: cfg.args.clone(),
            scp_cmd: cfg.scp_cmd.clone(),
            transfer_timeout: Duration::from_secs(10),
        }
    }
}

/// What to run on the remote host.
#[derive(Debug, Clone)]
pub enum RemoteProgram {
    Fixed(Vec<String>),
    /// `<cmd> engines -n N --profile-dir <dir>`, sized at start.
    Proxy { cmd: Vec<String>, profile_dir: String },
}

impl RemoteProgram {
    pub fn argv(&self, n: usize) -> Vec<String> {
        match self {
            Self::Fixed(argv) => argv.clone(),
            Self::Proxy { cmd, profile_dir } => {
                let mut argv = cmd.clone();
                argv.extend([
                    "engines".to_string(),
                    "-n".to_string(),
                    n.to_string(),
                    "--profile-dir".to_string(),
                    profile_dir.clone(),
                ]);
                argv
            }
        }
    }
}

/// A local/remote path pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub local: PathBuf,
    pub remote: String,
}

/// One remote process behind a local ssh client.
#[derive(Clone)]
pub struct SshLauncher {
    process: LocalProcessLauncher,
    target: SshTarget,
    settings: SshSettings,
    program: RemoteProgram,
    to_send: Vec<FileTransfer>,
    to_fetch: Vec<FileTransfer>,
    kill_delay: Duration,
}

impl SshLauncher {
    pub fn new(
        name: impl Into<String>,
        target: SshTarget,
        settings: SshSettings,
        program: RemoteProgram,
        spec: ProcessSpec,
    ) -> Self {
        let kill_delay = spec.kill_delay;
        Self {
            process: LocalProcessLauncher::new(name, spec),
            target,
            settings,
            program,
            to_send: Vec::new(),
            to_fetch: Vec::new(),
            kill_delay,
        }
    }

    /// Copy `local` to the remote host before starting.
    pub fn sending(mut self, local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        self.to_send.push(FileTransfer {
            local: local.into(),
            remote: remote.into(),
        });
        self
    }

    /// Copy `remote` back once the remote process has written it.
    pub fn fetching(mut self, remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        self.to_fetch.push(FileTransfer {
            local: local.into(),
            remote: remote.into(),
        });
        self
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn files_to_send(&self) -> &[FileTransfer] {
        &self.to_send
    }

    /// Local argv that runs `remote` on the target host.
    pub fn ssh_argv(&self, remote: &[String]) -> Vec<String> {
        let mut argv = self.settings.ssh_cmd.clone();
        argv.extend(self.settings.ssh_args.iter().cloned());
        argv.extend(self.target.ssh_port_args());
        argv.push(self.target.location());
        argv.push(shell_join(remote));
        argv
    }

    fn helper_argv(&self, remote: &[&str]) -> Vec<String> {
        let mut argv = self.settings.ssh_cmd.clone();
        argv.extend(self.target.ssh_port_args());
        argv.push(self.target.location());
        argv.push(remote.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" "));
        argv
    }

    fn scp_argv(&self, from: String, to: String) -> Vec<String> {
        let mut argv = self.settings.scp_cmd.clone();
        argv.extend(self.target.scp_port_args());
        argv.push(from);
        argv.push(to);
        argv
    }

    async fn send_file(&self, file: &FileTransfer) -> Result<(), LauncherError> {
        let deadline = tokio::time::Instant::now() + self.settings.transfer_timeout;
        while !file.local.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(LauncherError::Config(format!(
                    "{} never appeared, cannot send it to {}",
                    file.local.display(),
                    self.target.location()
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if let Some(parent) = Path::new(&file.remote).parent() {
            let dir = parent.display().to_string();
            if !dir.is_empty() {
                run_checked(&self.helper_argv(&["mkdir", "-p", "--", &dir]), None).await?;
            }
        }
        let dest = format!("{}:{}", self.target.location(), file.remote);
        run_checked(&self.scp_argv(file.local.display().to_string(), dest), None).await?;
        info!(launcher = %self.name(), local = %file.local.display(), remote = %file.remote, "sent file");
        Ok(())
    }

    async fn fetch_file(&self, file: &FileTransfer) -> Result<(), LauncherError> {
        let deadline = tokio::time::Instant::now() + self.settings.transfer_timeout;
        loop {
            let exists = run_command(&self.helper_argv(&["test", "-e", &file.remote]), None, None).await?;
            if exists.success {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LauncherError::Config(format!(
                    "{}:{} never appeared",
                    self.target.location(),
                    file.remote
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if let Some(parent) = file.local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let src = format!("{}:{}", self.target.location(), file.remote);
        run_checked(&self.scp_argv(src, file.local.display().to_string()), None).await?;
        info!(launcher = %self.name(), remote = %file.remote, local = %file.local.display(), "fetched file");
        Ok(())
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        self.process.lifecycle()
    }

    async fn start(&self, n: usize) -> Result<StartData, LauncherError> {
        for file in &self.to_send {
            if let Err(e) = self.send_file(file).await {
                if self.lifecycle().begin_start().is_ok() {
                    self.lifecycle().notify_stop(crate::state::StopData::StartFailed {
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        }
        self.process.set_command(self.ssh_argv(&self.program.argv(n)));
        let data = self.process.start(1).await?;

        if !self.to_fetch.is_empty() {
            let this = self.clone();
            tokio::spawn(async move {
                for file in &this.to_fetch {
                    if let Err(e) = this.fetch_file(file).await {
                        warn!(launcher = %this.name(), remote = %file.remote, error = %e, "fetch failed");
                    }
                }
            });
        }
        Ok(data)
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        interrupt_then_kill(self.clone(), self.kill_delay).await
    }

    /// Closes the ssh session with the `~.` escape; a kill also takes down
    /// the local client.
    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.lifecycle().require_running()?;
        match self.process.write_stdin(b"~.").await {
            Ok(()) => {
                debug!(launcher = %self.name(), signal = %sig, "sent ssh escape");
                if sig == Signal::Kill {
                    self.process.signal(Signal::Kill).await?;
                }
                Ok(())
            }
            Err(e) => {
                debug!(launcher = %self.name(), error = %e, "ssh stdin closed, signalling client");
                self.process.signal(sig).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SshSettings {
        SshSettings::from(&SshConfig::default())
    }

    #[test]
    fn parses_user_host_port() {
        let t: SshTarget = "me@node7:2222".parse().unwrap();
        assert_eq!(t.user.as_deref(), Some("me"));
        assert_eq!(t.host, "node7");
        assert_eq!(t.port, Some(2222));
        assert_eq!(t.location(), "me@node7");

        let t: SshTarget = "node7".parse().unwrap();
        assert_eq!(t, SshTarget::new("node7", None));

        assert!("me@".parse::<SshTarget>().is_err());
        assert!("node:abc".parse::<SshTarget>().is_err());
    }

    #[test]
    fn quoting_protects_spaces_and_quotes() {
        assert_eq!(shell_quote("plain-arg"), "plain-arg");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn ssh_argv_quotes_remote_command() {
        let target: SshTarget = "u@h:22".parse().unwrap();
        let launcher = SshLauncher::new(
            "ssh",
            target,
            settings(),
            RemoteProgram::Fixed(vec!["kluster-engine".into(), "--profile-dir".into(), "my dir".into()]),
            ProcessSpec::new(Vec::new()),
        );
        let argv = launcher.ssh_argv(&RemoteProgram::Fixed(vec![]).argv(0));
        assert_eq!(argv, vec!["ssh", "-tt", "-p", "22", "u@h", ""]);
        let argv = launcher.ssh_argv(&launcher.program.argv(1));
        assert_eq!(argv.last().unwrap(), "kluster-engine --profile-dir 'my dir'");
        assert_eq!(
            launcher.scp_argv("a".into(), "u@h:b".into()),
            vec!["scp", "-P", "22", "a", "u@h:b"]
        );
    }

    #[test]
    fn proxy_program_sizes_engine_count_at_start() {
        let program = RemoteProgram::Proxy {
            cmd: vec!["kluster".into()],
            profile_dir: ".kluster/profile_default".into(),
        };
        assert_eq!(
            program.argv(8),
            vec!["kluster", "engines", "-n", "8", "--profile-dir", ".kluster/profile_default"]
        );
    }

    #[test]
    fn remote_profile_dir_is_home_relative() {
        if let Some(home) = dirs::home_dir() {
            let local = home.join(".kluster").join("profile_x");
            assert_eq!(remote_profile_dir(&local), ".kluster/profile_x");
        }
        assert_eq!(remote_profile_dir(Path::new("/srv/kluster")), "/srv/kluster");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_local_file_fails_start() {
        let mut s = settings();
        s.transfer_timeout = Duration::from_millis(50);
        let launcher = SshLauncher::new(
            "ssh",
            SshTarget::new("localhost", None),
            s,
            RemoteProgram::Fixed(vec!["true".into()]),
            ProcessSpec::new(Vec::new()),
        )
        .sending("/nonexistent/kluster-engine.json", "sec/kluster-engine.json");
        assert!(launcher.start(1).await.is_err());
        assert_eq!(launcher.state(), crate::state::LaunchState::After);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_writes_escape_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdin.txt");
        // Stand-in for ssh: records its stdin and ignores its arguments.
        let script = format!("head -c 2 > {}", out.display());
        let s = SshSettings {
            ssh_cmd: vec!["sh".into(), "-c".into(), script],
            ssh_args: Vec::new(),
            scp_cmd: vec!["false".into()],
            transfer_timeout: Duration::from_millis(50),
        };
        let mut spec = ProcessSpec::new(Vec::new());
        spec.poll_interval = Duration::from_millis(20);
        let launcher = SshLauncher::new(
            "ssh",
            SshTarget::new("h", None),
            s,
            RemoteProgram::Fixed(vec!["x".into()]),
            spec,
        );
        launcher.start(1).await.unwrap();
        launcher.signal(Signal::Interrupt).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), launcher.lifecycle().stopped())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "~.");
    }
}
