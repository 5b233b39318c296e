//! Socket loop around [`TaskScheduler`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kluster_wire::messages::{topics, EngineNotification};
use kluster_wire::{recv_frames, EventSubscriber, Routed, Transport, ZmqPublisher, ZmqSubscriber};
use tracing::{debug, info, warn};
use zeromq::RouterSocket;

use crate::error::ControllerError;
use crate::scheduler::core::{SchedulerAction, TaskScheduler};
use crate::sockets::{bind_router, send_routed};
use crate::unit::{Shutdown, Unit};

/// Addresses the task scheduler binds and connects.
#[derive(Debug, Clone)]
pub struct TaskSchedulerSockets {
    /// Bound ROUTER clients submit to.
    pub client: Transport,
    /// Bound ROUTER engines connect their task DEALER to.
    pub engine: Transport,
    /// Hub notification feed (connect).
    pub notification: Transport,
    /// Hub monitor (connect).
    pub monitor: Transport,
}

pub struct TaskSchedulerUnit {
    sockets: TaskSchedulerSockets,
    scheduler: TaskScheduler,
    tick: Duration,
}

impl TaskSchedulerUnit {
    pub fn new(sockets: TaskSchedulerSockets, scheduler: TaskScheduler) -> Self {
        Self {
            sockets,
            scheduler,
            tick: Duration::from_millis(100),
        }
    }

    async fn execute(
        actions: Vec<SchedulerAction>,
        client: &mut RouterSocket,
        engine: &mut RouterSocket,
        monitor: &ZmqPublisher,
    ) {
        for action in actions {
            let result = match action {
                SchedulerAction::Dispatch { routed, .. } => send_routed(engine, &routed).await,
                SchedulerAction::Reply(routed) => send_routed(client, &routed).await,
                SchedulerAction::Monitor { topic, routed } => monitor.publish_monitor(topic, &routed).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "task scheduler action failed");
            }
        }
    }
}

#[async_trait]
impl Unit for TaskSchedulerUnit {
    fn name(&self) -> &str {
        "task-scheduler"
    }

    async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let mut client = bind_router(&self.sockets.client).await?;
        let mut engine = bind_router(&self.sockets.engine).await?;
        let monitor = ZmqPublisher::connect(&self.sockets.monitor).await?;
        let notifications = ZmqSubscriber::connect(&self.sockets.notification).await?;
        notifications.subscribe(topics::REGISTRATION_NOTIFICATION).await?;
        notifications.subscribe(topics::UNREGISTRATION_NOTIFICATION).await?;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("task scheduler running");

        loop {
            let actions = tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.scheduler.tick(Instant::now()),
                frames = recv_frames(&mut client) => {
                    match frames.and_then(Routed::from_frames) {
                        Ok(request) => self.scheduler.submit(request, Instant::now()),
                        Err(e) => {
                            warn!(error = %e, "bad task submission");
                            continue;
                        }
                    }
                }
                frames = recv_frames(&mut engine) => {
                    match frames.and_then(Routed::from_frames) {
                        Ok(mut reply) => match reply.pop_front_ident() {
                            Some(ident) => self.scheduler.engine_reply(&ident, reply, Instant::now()),
                            None => continue,
                        },
                        Err(e) => {
                            warn!(error = %e, "bad engine reply");
                            continue;
                        }
                    }
                }
                note = notifications.recv() => {
                    match note {
                        Ok((topic, message)) => match message.decode::<EngineNotification>() {
                            Ok(n) if topic == topics::REGISTRATION_NOTIFICATION => self
                                .scheduler
                                .engine_registered(n.engine_id, n.ident.into_bytes(), Instant::now()),
                            Ok(n) => self.scheduler.engine_unregistered(n.engine_id, Instant::now()),
                            Err(e) => {
                                warn!(error = %e, topic = %topic, "bad engine notification");
                                continue;
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "notification recv failed");
                            continue;
                        }
                    }
                }
            };
            if !actions.is_empty() {
                debug!(actions = actions.len(), "task scheduler actions");
            }
            Self::execute(actions, &mut client, &mut engine, &monitor).await;
        }

        info!(engines = self.scheduler.engine_count(), pending = self.scheduler.pending_count(), "task scheduler stopped");
        Ok(())
    }
}
