//! Local child processes.

pub mod signal;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::error::LauncherError;
use crate::state::{Lifecycle, StartData, StopData};
use crate::traits::{interrupt_then_kill, Launcher, Signal};

pub use signal::{process_alive, send_signal, terminate_process_tree};

/// How to run one local command.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub poll_interval: Duration,
    pub kill_delay: Duration,
}

impl ProcessSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            work_dir: None,
            env: BTreeMap::new(),
            poll_interval: Duration::from_millis(100),
            kill_delay: Duration::from_secs(2),
        }
    }
}

struct ProcessInner {
    lifecycle: Lifecycle,
    spec: Mutex<ProcessSpec>,
    pid: Mutex<Option<u32>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

/// Runs a single local process and watches it until it exits.
#[derive(Clone)]
pub struct LocalProcessLauncher {
    inner: Arc<ProcessInner>,
}

impl LocalProcessLauncher {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                lifecycle: Lifecycle::new(name),
                spec: Mutex::new(spec),
                pid: Mutex::new(None),
                stdin: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn spec(&self) -> ProcessSpec {
        self.inner.spec.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the command line. Takes effect on the next `start`.
    pub fn set_command(&self, argv: Vec<String>) {
        self.inner.spec.lock().unwrap_or_else(|e| e.into_inner()).argv = argv;
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write raw bytes to the child's stdin.
    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<(), LauncherError> {
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| LauncherError::Signal(format!("{}: stdin is closed", self.name())))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn spawn_child(&self, spec: &ProcessSpec) -> Result<Child, LauncherError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| LauncherError::Config(format!("{}: empty command", self.name())))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd.spawn()?)
    }

    async fn watch(inner: Arc<ProcessInner>, mut child: Child, pid: u32, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        let (exit_code, signal) = loop {
            ticker.tick().await;
            match child.try_wait() {
                Ok(Some(status)) => break (status.code(), exit_signal(&status)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(launcher = %inner.lifecycle.name(), pid, error = %e, "lost track of process");
                    break (None, None);
                }
            }
        };
        *inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
        inner.stdin.lock().await.take();
        inner.lifecycle.notify_stop(StopData::Exited {
            pid,
            exit_code,
            signal,
        });
    }
}

/// Captured result of a short-lived helper command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Run `argv` to completion, optionally feeding `input` on stdin.
pub async fn run_command(
    argv: &[String],
    input: Option<&[u8]>,
    work_dir: Option<&std::path::Path>,
) -> Result<CommandOutput, LauncherError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| LauncherError::Config("empty command".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    debug!(argv = ?argv, "running command");
    let mut child = cmd.spawn()?;
    if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin.write_all(bytes).await?;
        drop(stdin);
    }
    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        status: output.status.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run_command`] but a non-zero exit is an error.
pub async fn run_checked(argv: &[String], work_dir: Option<&std::path::Path>) -> Result<String, LauncherError> {
    let out = run_command(argv, None, work_dir).await?;
    if out.success {
        Ok(out.stdout)
    } else {
        Err(LauncherError::CommandFailed {
            command: argv.join(" "),
            status: out.status.clone(),
            output: out.combined(),
        })
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn forward_output<R>(reader: R, launcher: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(launcher = %launcher, stream, "{line}");
        }
    });
}

#[async_trait]
impl Launcher for LocalProcessLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn start(&self, _n: usize) -> Result<StartData, LauncherError> {
        self.lifecycle().begin_start()?;
        let spec = self.spec();
        let mut child = match self.spawn_child(&spec) {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle().notify_stop(StopData::StartFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            let reason = "process exited before reporting a pid".to_string();
            self.lifecycle().notify_stop(StopData::StartFailed {
                reason: reason.clone(),
            });
            return Err(LauncherError::ProcessState {
                name: self.name().to_string(),
                reason,
            });
        };
        info!(launcher = %self.name(), pid, argv = ?spec.argv, "process started");

        if let Some(out) = child.stdout.take() {
            forward_output(out, self.name().to_string(), "stdout");
        }
        if let Some(err) = child.stderr.take() {
            forward_output(err, self.name().to_string(), "stderr");
        }
        *self.inner.stdin.lock().await = child.stdin.take();
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid);

        self.lifecycle().notify_start(StartData::Pid(pid));
        tokio::spawn(Self::watch(
            Arc::clone(&self.inner),
            child,
            pid,
            spec.poll_interval,
        ));
        Ok(StartData::Pid(pid))
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        interrupt_then_kill(self.clone(), self.spec().kill_delay).await
    }

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.lifecycle().require_running()?;
        let pid = self.pid().ok_or_else(|| LauncherError::NotRunning {
            name: self.name().to_string(),
            state: self.state(),
        })?;
        debug!(launcher = %self.name(), pid, signal = %sig, "signalling process");
        match sig {
            Signal::Kill => terminate_process_tree(pid).await,
            other => send_signal(pid, other).await,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::LaunchState;

    fn sh(script: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new(vec!["sh".into(), "-c".into(), script.into()]);
        spec.poll_interval = Duration::from_millis(20);
        spec.kill_delay = Duration::from_millis(300);
        spec
    }

    #[tokio::test]
    async fn exit_code_lands_in_stop_data() {
        let launcher = LocalProcessLauncher::new("exit3", sh("exit 3"));
        let started = launcher.start(1).await.unwrap();
        assert!(matches!(started, StartData::Pid(_)));
        let stopped = tokio::time::timeout(Duration::from_secs(5), launcher.lifecycle().stopped())
            .await
            .unwrap();
        match stopped {
            StopData::Exited { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected stop data {other:?}"),
        }
        assert_eq!(launcher.state(), LaunchState::After);
        assert!(launcher.pid().is_none());
    }

    #[tokio::test]
    async fn second_start_fails() {
        let launcher = LocalProcessLauncher::new("sleep", sh("sleep 5"));
        launcher.start(1).await.unwrap();
        assert!(matches!(
            launcher.start(1).await,
            Err(LauncherError::ProcessState { .. })
        ));
        launcher.signal(Signal::Kill).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), launcher.lifecycle().stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_when_interrupt_is_ignored() {
        let launcher = LocalProcessLauncher::new("stubborn", sh("trap '' INT; sleep 30"));
        launcher.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        launcher.stop().await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), launcher.lifecycle().stopped())
            .await
            .unwrap();
        match stopped {
            StopData::Exited { signal, .. } => assert_eq!(signal, Some(9)),
            other => panic!("unexpected stop data {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_moves_to_after() {
        let launcher = LocalProcessLauncher::new(
            "missing",
            ProcessSpec::new(vec!["/nonexistent/kluster-bin".into()]),
        );
        assert!(launcher.start(1).await.is_err());
        assert_eq!(launcher.state(), LaunchState::After);
        assert!(matches!(launcher.stop_data(), Some(StopData::StartFailed { .. })));
    }

    #[tokio::test]
    async fn signal_before_start_is_rejected() {
        let launcher = LocalProcessLauncher::new("idle", sh("true"));
        assert!(matches!(
            launcher.signal(Signal::Interrupt).await,
            Err(LauncherError::NotRunning { .. })
        ));
        launcher.stop().await.unwrap();
        assert_eq!(launcher.state(), LaunchState::Before);
    }

    #[tokio::test]
    async fn run_command_feeds_stdin_and_captures_output() {
        let argv: Vec<String> = vec!["sh".into(), "-c".into(), "cat; echo oops >&2; exit 4".into()];
        let out = run_command(&argv, Some(b"hello"), None).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.combined(), "hello\noops");
        assert!(matches!(
            run_checked(&argv, None).await,
            Err(LauncherError::CommandFailed { .. })
        ));
    }

    #[tokio::test]
    async fn set_command_applies_to_start() {
        let launcher = LocalProcessLauncher::new("swap", sh("exit 1"));
        launcher.set_command(vec!["sh".into(), "-c".into(), "exit 0".into()]);
        launcher.start(1).await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), launcher.lifecycle().stopped())
            .await
            .unwrap();
        assert!(stopped.is_success());
    }
}
