use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kluster_wire::{
    parse_monitor_frames, recv_frames, Channel, ChannelMap, EventPublisher, EventSubscriber, Routed, Transport,
    ZmqPublisher, ZmqSubscriber,
};
use tracing::{debug, info, warn};
use zeromq::RouterSocket;

use crate::error::ControllerError;
use crate::hub::core::{Hub, HubAction};
use crate::sockets::{bind_router, send_routed};
use crate::unit::{Shutdown, Unit};

/// Every address the hub binds.
#[derive(Debug, Clone)]
pub struct HubSockets {
    pub registration: Transport,
    pub hb_ping: Transport,
    pub hb_pong: Transport,
    pub notification: Transport,
    pub monitor: Transport,
}

impl HubSockets {
    pub fn from_map(map: &ChannelMap) -> Self {
        Self {
            registration: map.bind(Channel::Registration),
            hb_ping: map.bind(Channel::HbPing),
            hb_pong: map.bind(Channel::HbPong),
            notification: map.bind(Channel::Notification),
            monitor: map.bind(Channel::Monitor),
        }
    }
}

pub struct HubUnit {
    sockets: HubSockets,
    hub: Hub,
    heartbeat_period: Duration,
    /// Where to write the engine table, when persistence is on.
    engine_state: Option<PathBuf>,
}

impl HubUnit {
    pub fn new(sockets: HubSockets, hub: Hub, heartbeat_period: Duration, engine_state: Option<PathBuf>) -> Self {
        Self {
            sockets,
            hub,
            heartbeat_period,
            engine_state,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

struct Links {
    registration: RouterSocket,
    ping: ZmqPublisher,
    notification: ZmqPublisher,
}

impl Links {
    async fn execute(&mut self, actions: Vec<HubAction>, engine_state: Option<&PathBuf>, shutdown: &Shutdown) {
        for action in actions {
            let result: Result<(), ControllerError> = match action {
                HubAction::Reply(routed) => send_routed(&mut self.registration, &routed).await.map_err(Into::into),
                HubAction::Ping(beat) => self.ping.publish_frames(vec![beat]).await.map_err(Into::into),
                HubAction::Notify { topic, message } => {
                    self.notification.publish(topic, message).await.map_err(Into::into)
                }
                HubAction::PersistEngines(state) => match engine_state {
                    Some(path) => state.save(path),
                    None => Ok(()),
                },
                HubAction::Shutdown => {
                    shutdown.trigger();
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "hub action failed");
            }
        }
    }
}

#[async_trait]
impl Unit for HubUnit {
    fn name(&self) -> &str {
        "hub"
    }

    async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let mut links = Links {
            registration: bind_router(&self.sockets.registration).await?,
            ping: ZmqPublisher::bind(&self.sockets.hb_ping).await?,
            notification: ZmqPublisher::bind(&self.sockets.notification).await?,
        };
        let mut pong = bind_router(&self.sockets.hb_pong).await?;
        let monitor = ZmqSubscriber::bind(&self.sockets.monitor).await?;
        monitor.subscribe("").await?;

        let mut heartbeat = tokio::time::interval(self.heartbeat_period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(period_ms = self.heartbeat_period.as_millis() as u64, "hub running");

        loop {
            let actions = tokio::select! {
                _ = shutdown.wait() => break,
                _ = heartbeat.tick() => self.hub.beat(Instant::now()),
                frames = recv_frames(&mut links.registration) => match frames.and_then(Routed::from_frames) {
                    Ok(request) => self.hub.query(request, Instant::now()),
                    Err(e) => {
                        warn!(error = %e, "bad hub request");
                        continue;
                    }
                },
                frames = recv_frames(&mut pong) => match frames {
                    Ok(frames) if frames.len() >= 2 => self.hub.pong(&frames[0], &frames[1]),
                    Ok(frames) => {
                        debug!(frames = frames.len(), "short pong dropped");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "pong recv failed");
                        continue;
                    }
                },
                frames = monitor.recv_frames() => {
                    match frames.and_then(parse_monitor_frames) {
                        Ok((topic, routed)) => self.hub.monitor(&topic, routed),
                        Err(e) => warn!(error = %e, "bad monitor frames"),
                    }
                    continue;
                }
            };
            links.execute(actions, self.engine_state.as_ref(), &shutdown).await;
        }

        info!(engines = self.hub.registry().len(), "hub stopped");
        Ok(())
    }
}
