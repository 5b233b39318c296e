//! Launcher lifecycle shared by every backend.
//!
//! A launcher moves `Before -> Running -> After` and never back. The stop
//! transition happens exactly once; callbacks registered with
//! [`Lifecycle::on_stop`] run in registration order, outside the lock, with
//! the first stop data ever recorded.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::LauncherError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchState {
    Before,
    Running,
    After,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Before => "before",
            Self::Running => "running",
            Self::After => "after",
        })
    }
}

impl FromStr for LaunchState {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(Self::Before),
            "running" => Ok(Self::Running),
            "after" => Ok(Self::After),
            other => Err(LauncherError::UnknownStatus(other.to_string())),
        }
    }
}

/// What a launcher reports once started.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartData {
    Pid(u32),
    JobId(String),
    /// Per-child start data of an engine set, keyed by child name.
    Set(BTreeMap<String, StartData>),
}

/// What a launcher reports once stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopData {
    Exited {
        pid: u32,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    Job {
        job_id: String,
        output: String,
    },
    Set(BTreeMap<String, StopData>),
    StartFailed {
        reason: String,
    },
}

impl StopData {
    /// True when the stop represents a clean exit of everything launched.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Exited { exit_code, .. } => *exit_code == Some(0),
            Self::Job { .. } => true,
            Self::Set(children) => children.values().all(StopData::is_success),
            Self::StartFailed { .. } => false,
        }
    }
}

pub type StopCallback = Box<dyn FnOnce(&StopData) + Send + 'static>;

struct Inner {
    state: LaunchState,
    starting: bool,
    start_data: Option<StartData>,
    stop_data: Option<StopData>,
    callbacks: Vec<StopCallback>,
}

/// Cloneable handle to one launcher's state.
#[derive(Clone)]
pub struct Lifecycle {
    name: Arc<str>,
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner {
                state: LaunchState::Before,
                starting: false,
                start_data: None,
                stop_data: None,
                callbacks: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LaunchState {
        self.lock().state
    }

    pub fn start_data(&self) -> Option<StartData> {
        self.lock().start_data.clone()
    }

    pub fn stop_data(&self) -> Option<StopData> {
        self.lock().stop_data.clone()
    }

    /// Claim the single start. Fails unless the launcher is fresh.
    pub fn begin_start(&self) -> Result<(), LauncherError> {
        let mut inner = self.lock();
        if inner.state != LaunchState::Before || inner.starting {
            return Err(LauncherError::already_started(&self.name));
        }
        inner.starting = true;
        Ok(())
    }

    pub fn require_running(&self) -> Result<(), LauncherError> {
        let state = self.state();
        if state == LaunchState::Running {
            Ok(())
        } else {
            Err(LauncherError::NotRunning {
                name: self.name.to_string(),
                state,
            })
        }
    }

    pub fn notify_start(&self, data: StartData) {
        let mut inner = self.lock();
        inner.starting = false;
        if inner.state != LaunchState::Before {
            debug!(launcher = %self.name, state = %inner.state, "ignoring late start notification");
            return;
        }
        info!(launcher = %self.name, data = ?data, "launcher started");
        inner.state = LaunchState::Running;
        inner.start_data = Some(data);
    }

    /// Move to `After` and fire callbacks. Later calls are no-ops.
    pub fn notify_stop(&self, data: StopData) {
        let callbacks = {
            let mut inner = self.lock();
            if inner.state == LaunchState::After {
                debug!(launcher = %self.name, "already stopped");
                return;
            }
            info!(launcher = %self.name, data = ?data, "launcher stopped");
            inner.state = LaunchState::After;
            inner.starting = false;
            inner.stop_data = Some(data.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(&data);
        }
    }

    /// Register a callback, or run it right away if already stopped.
    pub fn on_stop(&self, callback: StopCallback) {
        let stored = {
            let mut inner = self.lock();
            match &inner.stop_data {
                Some(data) if inner.state == LaunchState::After => data.clone(),
                _ => {
                    inner.callbacks.push(callback);
                    return;
                }
            }
        };
        callback(&stored);
    }

    /// Resolve once the launcher has stopped.
    pub async fn stopped(&self) -> StopData {
        let (tx, rx) = oneshot::channel();
        self.on_stop(Box::new(move |data| {
            let _ = tx.send(data.clone());
        }));
        match rx.await {
            Ok(data) => data,
            Err(_) => StopData::StartFailed {
                reason: "lifecycle dropped".into(),
            },
        }
    }
}
