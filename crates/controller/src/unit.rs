//! Unit trait and lifecycle management.
//!
//! Every controller component (hub, task scheduler, broadcast node, relay)
//! is a [`Unit`]: a loop that owns its sockets and state and talks to the
//! others only over ZeroMQ. [`UnitRunner`] spawns a set of units, waits for
//! a shutdown request or an OS signal, then stops them within a grace period.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ControllerError;

// ── Shutdown handle ──────────────────────────────────────────────────

/// Cloneable stop flag shared by the runner and every unit.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Ask every unit to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit trait ───────────────────────────────────────────────────────

/// A long-running controller component.
///
/// `run` binds or connects the unit's sockets, processes traffic until
/// `shutdown` fires, and returns. Errors end only this unit.
#[async_trait]
pub trait Unit: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError>;
}

// ── UnitRunner ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UnitRunnerConfig {
    /// Maximum time units get to return after shutdown (default: 5s).
    pub shutdown_timeout: Duration,
    /// Also stop on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl Default for UnitRunnerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            handle_signals: true,
        }
    }
}

/// Runs a set of [`Unit`]s to completion.
///
/// A unit that fails is logged and the rest keep running; the set stops on
/// an OS signal or when any holder of the [`Shutdown`] handle triggers it
/// (for example the hub on `shutdown_request`).
pub struct UnitRunner;

impl UnitRunner {
    pub async fn run(
        units: Vec<Box<dyn Unit>>,
        shutdown: Shutdown,
        config: UnitRunnerConfig,
    ) -> Result<(), ControllerError> {
        let mut handles = Vec::with_capacity(units.len());
        for mut unit in units {
            let name = unit.name().to_string();
            let unit_shutdown = shutdown.clone();
            info!(unit = %name, "starting unit");
            let handle = tokio::spawn(async move {
                match unit.run(unit_shutdown).await {
                    Ok(()) => info!(unit = %unit.name(), "unit stopped"),
                    Err(e) => error!(unit = %unit.name(), error = %e, "unit failed"),
                }
            });
            handles.push((name, handle));
        }

        if config.handle_signals {
            tokio::select! {
                _ = shutdown.wait() => {}
                res = os_signal() => {
                    match res {
                        Ok(()) => info!("shutdown signal received"),
                        Err(e) => warn!(error = %e, "signal handler failed, stopping"),
                    }
                }
            }
        } else {
            shutdown.wait().await;
        }
        shutdown.trigger();

        info!(timeout = ?config.shutdown_timeout, units = handles.len(), "stopping units");
        let deadline = tokio::time::Instant::now() + config.shutdown_timeout;
        for (name, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(unit = %name, error = %e, "unit task panicked"),
                Err(_) => {
                    warn!(unit = %name, "unit did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("all units stopped");
        Ok(())
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
async fn os_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingUnit {
        name: String,
        runs: Arc<AtomicU32>,
        stops: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Unit for CountingUnit {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            shutdown.wait().await;
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingUnit;

    #[async_trait]
    impl Unit for FailingUnit {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&mut self, _shutdown: Shutdown) -> Result<(), ControllerError> {
            Err(ControllerError::Unit {
                name: "failing".into(),
                reason: "bind refused".into(),
            })
        }
    }

    struct StuckUnit;

    #[async_trait]
    impl Unit for StuckUnit {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn run(&mut self, _shutdown: Shutdown) -> Result<(), ControllerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn config() -> UnitRunnerConfig {
        UnitRunnerConfig {
            shutdown_timeout: Duration::from_millis(200),
            handle_signals: false,
        }
    }

    #[tokio::test]
    async fn units_start_once_and_stop_on_trigger() {
        let runs = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let units: Vec<Box<dyn Unit>> = (0..3)
            .map(|i| {
                Box::new(CountingUnit {
                    name: format!("unit-{i}"),
                    runs: runs.clone(),
                    stops: stops.clone(),
                }) as Box<dyn Unit>
            })
            .collect();

        let shutdown = Shutdown::new();
        let handle = tokio::spawn(UnitRunner::run(units, shutdown.clone(), config()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runner should finish")
            .unwrap()
            .unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_unit_does_not_stop_the_others() {
        let runs = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let units: Vec<Box<dyn Unit>> = vec![
            Box::new(FailingUnit),
            Box::new(CountingUnit {
                name: "survivor".into(),
                runs: runs.clone(),
                stops: stops.clone(),
            }),
        ];
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(UnitRunner::run(units, shutdown.clone(), config()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_triggered());
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stuck_unit_is_aborted_after_timeout() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let started = tokio::time::Instant::now();
        UnitRunner::run(vec![Box::new(StuckUnit)], shutdown, config())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn shutdown_wait_returns_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }
}
