use std::time::{Duration, Instant};

use async_trait::async_trait;
use kluster_wire::messages::{topics, EngineNotification};
use kluster_wire::{
    recv_frames, Channel, ChannelMap, EventSubscriber, Routed, Transport, WireError, ZmqPublisher, ZmqSubscriber,
};
use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket};

use crate::broadcast::node::{BroadcastAction, BroadcastNode};
use crate::broadcast::tree::BroadcastTree;
use crate::error::ControllerError;
use crate::sockets::{bind_router, connect_dealer, send_routed};
use crate::unit::{Shutdown, Unit};

/// Addresses one broadcast node binds and connects.
#[derive(Debug, Clone)]
pub struct BroadcastSockets {
    /// Bound ROUTER the parent (or, at the root, clients) send to.
    pub inbound: Transport,
    /// Inbound addresses of the two children, for inner nodes.
    pub children: Option<[Transport; 2]>,
    /// Bound engine-facing ROUTER, for leaves.
    pub engines: Option<Transport>,
    pub notification: Transport,
    pub monitor: Transport,
}

impl BroadcastSockets {
    pub fn from_map(map: &ChannelMap, tree: &BroadcastTree, id: u32) -> Self {
        let children = tree
            .node(id)
            .and_then(|n| n.children)
            .map(|[l, r]| [map.connect(Channel::BroadcastNode(l)), map.connect(Channel::BroadcastNode(r))]);
        let engines = children
            .is_none()
            .then(|| map.bind(Channel::BroadcastLeaf(id + 1 - tree.leaf_count())));
        Self {
            inbound: map.bind(Channel::BroadcastNode(id)),
            children,
            engines,
            notification: map.connect(Channel::Notification),
            monitor: map.connect(Channel::Monitor),
        }
    }
}

pub struct BroadcastUnit {
    name: String,
    sockets: BroadcastSockets,
    node: BroadcastNode,
    tick: Duration,
}

impl BroadcastUnit {
    pub fn new(sockets: BroadcastSockets, node: BroadcastNode) -> Self {
        Self {
            name: format!("broadcast-{}", node.id()),
            sockets,
            node,
            tick: Duration::from_millis(250),
        }
    }
}

async fn recv_optional<S>(socket: Option<&mut S>) -> Result<Vec<Vec<u8>>, WireError>
where
    S: SocketRecv + Send,
{
    match socket {
        Some(s) => recv_frames(s).await,
        None => std::future::pending().await,
    }
}

struct Links {
    inbound: RouterSocket,
    left: Option<DealerSocket>,
    right: Option<DealerSocket>,
    engines: Option<RouterSocket>,
    monitor: ZmqPublisher,
}

impl Links {
    async fn execute(&mut self, actions: Vec<BroadcastAction>) {
        for action in actions {
            let result = match action {
                BroadcastAction::Up(routed) => send_routed(&mut self.inbound, &routed).await,
                BroadcastAction::Child { index, routed } => {
                    let child = if index == 0 { self.left.as_mut() } else { self.right.as_mut() };
                    match child {
                        Some(socket) => send_routed(socket, &routed).await,
                        None => Err(WireError::Connection(format!("no child {index}"))),
                    }
                }
                BroadcastAction::Engine(routed) => match self.engines.as_mut() {
                    Some(socket) => send_routed(socket, &routed).await,
                    None => Err(WireError::Connection("not a leaf".into())),
                },
                BroadcastAction::Monitor { topic, routed } => self.monitor.publish_monitor(topic, &routed).await,
            };
            if let Err(e) = result {
                warn!(error = %e, "broadcast action failed");
            }
        }
    }
}

#[async_trait]
impl Unit for BroadcastUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let (left, right) = match &self.sockets.children {
            Some([l, r]) => (Some(connect_dealer(l).await?), Some(connect_dealer(r).await?)),
            None => (None, None),
        };
        let engines = match &self.sockets.engines {
            Some(t) => Some(bind_router(t).await?),
            None => None,
        };
        let mut links = Links {
            inbound: bind_router(&self.sockets.inbound).await?,
            left,
            right,
            engines,
            monitor: ZmqPublisher::connect(&self.sockets.monitor).await?,
        };
        let notifications = ZmqSubscriber::connect(&self.sockets.notification).await?;
        notifications.subscribe(topics::REGISTRATION_NOTIFICATION).await?;
        notifications.subscribe(topics::UNREGISTRATION_NOTIFICATION).await?;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(node = self.node.id(), leaf = self.node.is_leaf(), "broadcast node running");

        loop {
            let actions = tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.node.tick(Instant::now()),
                frames = recv_frames(&mut links.inbound) => match frames.and_then(Routed::from_frames) {
                    Ok(request) => self.node.request(request, Instant::now()),
                    Err(e) => {
                        warn!(error = %e, "bad broadcast request");
                        continue;
                    }
                },
                frames = recv_optional(links.left.as_mut()) => match frames.and_then(Routed::from_frames) {
                    Ok(reply) => self.node.child_reply(0, reply),
                    Err(e) => {
                        warn!(error = %e, child = 0, "bad child reply");
                        continue;
                    }
                },
                frames = recv_optional(links.right.as_mut()) => match frames.and_then(Routed::from_frames) {
                    Ok(reply) => self.node.child_reply(1, reply),
                    Err(e) => {
                        warn!(error = %e, child = 1, "bad child reply");
                        continue;
                    }
                },
                frames = recv_optional(links.engines.as_mut()) => match frames.and_then(Routed::from_frames) {
                    Ok(mut reply) => match reply.pop_front_ident() {
                        Some(ident) => self.node.engine_reply(&ident, reply),
                        None => continue,
                    },
                    Err(e) => {
                        warn!(error = %e, "bad engine reply");
                        continue;
                    }
                },
                note = notifications.recv() => match note {
                    Ok((topic, message)) => match message.decode::<EngineNotification>() {
                        Ok(n) if topic == topics::REGISTRATION_NOTIFICATION => {
                            self.node.engine_registered(n.engine_id, n.ident);
                            continue;
                        }
                        Ok(n) => self.node.engine_unregistered(n.engine_id),
                        Err(e) => {
                            warn!(error = %e, topic = %topic, "bad engine notification");
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "notification recv failed");
                        continue;
                    }
                },
            };
            if !actions.is_empty() {
                debug!(node = self.node.id(), actions = actions.len(), "broadcast actions");
            }
            links.execute(actions).await;
        }

        info!(node = self.node.id(), pending = self.node.pending_count(), "broadcast node stopped");
        Ok(())
    }
}
