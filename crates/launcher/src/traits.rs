use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::LauncherError;
use crate::state::{LaunchState, Lifecycle, StartData, StopCallback, StopData};

/// Signals a launcher can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
    Other(i32),
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Self::Interrupt => 2,
            Self::Terminate => 15,
            Self::Kill => 9,
            Self::Other(n) => n,
        }
    }

    /// Parse `INT`, `SIGTERM`, `kill` or a bare number.
    pub fn parse(s: &str) -> Result<Self, LauncherError> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "INT" => Ok(Self::Interrupt),
            "TERM" => Ok(Self::Terminate),
            "KILL" => Ok(Self::Kill),
            other => other
                .parse::<i32>()
                .map(|n| match n {
                    2 => Self::Interrupt,
                    15 => Self::Terminate,
                    9 => Self::Kill,
                    n => Self::Other(n),
                })
                .map_err(|_| LauncherError::Config(format!("unknown signal '{s}'"))),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Kill => f.write_str("SIGKILL"),
            Self::Other(n) => write!(f, "signal {n}"),
        }
    }
}

/// Supervises one process, process set, or batch job.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn state(&self) -> LaunchState {
        self.lifecycle().state()
    }

    fn start_data(&self) -> Option<StartData> {
        self.lifecycle().start_data()
    }

    fn stop_data(&self) -> Option<StopData> {
        self.lifecycle().stop_data()
    }

    fn on_stop(&self, callback: StopCallback) {
        self.lifecycle().on_stop(callback)
    }

    /// Launch `n` units of work. Only valid once, from `Before`.
    async fn start(&self, n: usize) -> Result<StartData, LauncherError>;

    /// Ask the launched work to stop. Returns before it has.
    async fn stop(&self) -> Result<(), LauncherError>;

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError>;
}

/// Interrupt now, kill after `kill_delay` if still running.
///
/// The kill runs on a spawned task so `stop` never blocks on it.
pub async fn interrupt_then_kill<L>(launcher: L, kill_delay: Duration) -> Result<(), LauncherError>
where
    L: Launcher + Clone + 'static,
{
    if launcher.state() != LaunchState::Running {
        debug!(launcher = %launcher.name(), state = %launcher.state(), "stop: not running");
        return Ok(());
    }
    if let Err(e) = launcher.signal(Signal::Interrupt).await {
        debug!(launcher = %launcher.name(), error = %e, "interrupt failed");
    }
    tokio::spawn(async move {
        tokio::time::sleep(kill_delay).await;
        if launcher.state() == LaunchState::Running {
            warn!(launcher = %launcher.name(), "still running after interrupt, killing");
            if let Err(e) = launcher.signal(Signal::Kill).await {
                debug!(launcher = %launcher.name(), error = %e, "kill failed");
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_and_numbers_parse() {
        assert_eq!(Signal::parse("INT").unwrap(), Signal::Interrupt);
        assert_eq!(Signal::parse("sigterm").unwrap(), Signal::Terminate);
        assert_eq!(Signal::parse("9").unwrap(), Signal::Kill);
        assert_eq!(Signal::parse("10").unwrap(), Signal::Other(10));
        assert!(Signal::parse("BOGUS").is_err());
        assert_eq!(Signal::Kill.number(), 9);
    }
}
