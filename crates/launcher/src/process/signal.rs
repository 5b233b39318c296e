//! OS-level signal delivery.
//!
//! Local processes are spawned as leaders of their own process group, so
//! [`terminate_process_tree`] can take down everything a launched command
//! forked with a single call.

use tracing::debug;

use crate::error::LauncherError;
use crate::traits::Signal;

#[cfg(unix)]
fn to_nix(sig: Signal) -> Result<nix::sys::signal::Signal, LauncherError> {
    use nix::sys::signal::Signal as Nix;
    match sig {
        Signal::Interrupt => Ok(Nix::SIGINT),
        Signal::Terminate => Ok(Nix::SIGTERM),
        Signal::Kill => Ok(Nix::SIGKILL),
        Signal::Other(n) => Nix::try_from(n)
            .map_err(|e| LauncherError::Signal(format!("invalid signal {n}: {e}"))),
    }
}

/// Deliver `sig` to one process.
#[cfg(unix)]
pub async fn send_signal(pid: u32, sig: Signal) -> Result<(), LauncherError> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| LauncherError::Signal(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), to_nix(sig)?)
        .map_err(|e| LauncherError::Signal(format!("kill({pid}, {sig}): {e}")))?;
    debug!(pid, signal = %sig, "signal sent");
    Ok(())
}

#[cfg(windows)]
pub async fn send_signal(pid: u32, sig: Signal) -> Result<(), LauncherError> {
    match sig {
        Signal::Kill => terminate_process_tree(pid).await,
        Signal::Interrupt | Signal::Terminate => taskkill(pid, false).await,
        Signal::Other(n) => Err(LauncherError::Unsupported(format!(
            "signal {n} is not supported on windows"
        ))),
    }
}

/// Kill a process and every process in its group.
#[cfg(unix)]
pub async fn terminate_process_tree(pid: u32) -> Result<(), LauncherError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal as Nix};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| LauncherError::Signal(format!("pid {pid} out of range")))?;
    match killpg(Pid::from_raw(raw), Nix::SIGKILL) {
        Ok(()) => {
            debug!(pid, "killed process group");
            Ok(())
        }
        Err(Errno::ESRCH) | Err(Errno::EPERM) => kill(Pid::from_raw(raw), Nix::SIGKILL)
            .map_err(|e| LauncherError::Signal(format!("kill({pid}, SIGKILL): {e}"))),
        Err(e) => Err(LauncherError::Signal(format!("killpg({pid}): {e}"))),
    }
}

#[cfg(windows)]
pub async fn terminate_process_tree(pid: u32) -> Result<(), LauncherError> {
    taskkill(pid, true).await
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> Result<(), LauncherError> {
    let mut cmd = tokio::process::Command::new("taskkill");
    cmd.args(["/pid", &pid.to_string(), "/t"]);
    if force {
        cmd.arg("/f");
    }
    let status = cmd.status().await?;
    if status.success() {
        debug!(pid, force, "taskkill succeeded");
        Ok(())
    } else {
        Err(LauncherError::Signal(format!("taskkill /pid {pid} exited with {status}")))
    }
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/fi", &format!("PID eq {pid}"), "/nh"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}
