//! A set of launchers started and stopped as one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::LauncherError;
use crate::state::{Lifecycle, StartData, StopData};
use crate::traits::{Launcher, Signal};

/// Shared handle to one member of a set.
pub type ChildLauncher = Arc<dyn Launcher>;

/// Produces the members for a start of `n` engines.
pub type ChildPlan = Box<dyn Fn(usize) -> Result<Vec<(String, ChildLauncher)>, LauncherError> + Send + Sync>;

#[derive(Default)]
struct Members {
    running: BTreeMap<String, ChildLauncher>,
    stopped: BTreeMap<String, StopData>,
    starting: bool,
}

struct SetInner {
    lifecycle: Lifecycle,
    plan: ChildPlan,
    stagger: Duration,
    members: Mutex<Members>,
}

impl SetInner {
    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn child_stopped(&self, key: &str, data: StopData) {
        debug!(set = %self.lifecycle.name(), child = %key, "engine stopped");
        {
            let mut members = self.members();
            members.running.remove(key);
            members.stopped.insert(key.to_string(), data);
        }
        self.finish_if_done();
    }

    /// The set stops once the start loop has finished and no member runs.
    fn finish_if_done(&self) {
        let collected = {
            let members = self.members();
            if members.starting || !members.running.is_empty() {
                return;
            }
            members.stopped.clone()
        };
        self.lifecycle.notify_stop(StopData::Set(collected));
    }

    fn snapshot(&self) -> Vec<(String, ChildLauncher)> {
        self.members()
            .running
            .iter()
            .map(|(k, l)| (k.clone(), Arc::clone(l)))
            .collect()
    }
}

#[derive(Clone)]
pub struct EngineSetLauncher {
    inner: Arc<SetInner>,
}

impl EngineSetLauncher {
    pub fn new(name: impl Into<String>, plan: ChildPlan, stagger: Duration) -> Self {
        Self {
            inner: Arc::new(SetInner {
                lifecycle: Lifecycle::new(name),
                plan,
                stagger,
                members: Mutex::new(Members::default()),
            }),
        }
    }

    /// Number of members still running.
    pub fn running(&self) -> usize {
        self.inner.members().running.len()
    }

    fn watch_child(&self, key: &str, child: &ChildLauncher) {
        let weak: Weak<SetInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        child.on_stop(Box::new(move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.child_stopped(&key, data.clone());
            }
        }));
    }
}

#[async_trait]
impl Launcher for EngineSetLauncher {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn start(&self, n: usize) -> Result<StartData, LauncherError> {
        self.lifecycle().begin_start()?;
        let children = match (self.inner.plan)(n) {
            Ok(children) => children,
            Err(e) => {
                self.lifecycle().notify_stop(StopData::StartFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        info!(set = %self.name(), engines = children.len(), "starting engine set");
        self.inner.members().starting = true;

        let mut started = BTreeMap::new();
        for (i, (key, child)) in children.into_iter().enumerate() {
            if i > 0 && !self.inner.stagger.is_zero() {
                tokio::time::sleep(self.inner.stagger).await;
            }
            self.inner
                .members()
                .running
                .insert(key.clone(), Arc::clone(&child));
            self.watch_child(&key, &child);
            match child.start(1).await {
                Ok(data) => {
                    started.insert(key, data);
                }
                Err(e) => warn!(set = %self.name(), child = %key, error = %e, "engine failed to start"),
            }
        }

        self.inner.members().starting = false;
        let data = StartData::Set(started);
        self.lifecycle().notify_start(data.clone());
        self.inner.finish_if_done();
        Ok(data)
    }

    async fn stop(&self) -> Result<(), LauncherError> {
        for (key, child) in self.inner.snapshot() {
            if let Err(e) = child.stop().await {
                warn!(set = %self.name(), child = %key, error = %e, "stop failed");
            }
        }
        Ok(())
    }

    async fn signal(&self, sig: Signal) -> Result<(), LauncherError> {
        self.lifecycle().require_running()?;
        let mut first_error = None;
        for (key, child) in self.inner.snapshot() {
            if let Err(e) = child.signal(sig).await {
                warn!(set = %self.name(), child = %key, signal = %sig, error = %e, "signal failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
