//! Monitored relay queues.
//!
//! A relay moves traffic between a client-facing and an engine-facing socket
//! without looking at it, and publishes a copy of everything it moves to the
//! hub monitor. The mux and control queues are ROUTER-ROUTER pairs that swap
//! the first two identities; the pure task queue is a ROUTER-DEALER pair that
//! lets the DEALER balance round-robin; iopub is a SUB-PUB pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kluster_wire::messages::topics;
use kluster_wire::{recv_frames, send_frames, Channel, ChannelMap, Routed, Transport, WireError, ZmqPublisher};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::sockets::{bind_dealer, bind_pub, bind_router, bind_sub_all, send_routed};
use crate::unit::{Shutdown, Unit};

/// Message counts kept by a relay.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    total: AtomicU64,
    per_topic: Mutex<HashMap<String, u64>>,
}

impl RelayMetrics {
    async fn record(&self, topic: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.per_topic.lock().await.entry(topic.to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Per-topic counts, sorted by topic.
    pub async fn counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<_> = self.per_topic.lock().await.iter().map(|(t, n)| (t.clone(), *n)).collect();
        counts.sort();
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// Both sides ROUTER; the destination identity rides as the second frame.
    RouterRouter,
    /// Clients on a ROUTER, engines on a DEALER.
    RouterDealer,
    /// Engines publish into a SUB, clients subscribe to a PUB.
    SubPub,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub name: &'static str,
    pub kind: RelayKind,
    /// Bound socket clients talk to.
    pub client: Transport,
    /// Bound socket engines talk to.
    pub engine: Transport,
    /// Hub monitor (connect).
    pub monitor: Transport,
    /// Monitor topic for client-to-engine traffic, or all traffic for SUB-PUB.
    pub in_topic: &'static str,
    /// Monitor topic for engine-to-client traffic.
    pub out_topic: &'static str,
}

impl RelayConfig {
    pub fn mux(map: &ChannelMap) -> Self {
        Self {
            name: "mux",
            kind: RelayKind::RouterRouter,
            client: map.bind(Channel::MuxClient),
            engine: map.bind(Channel::MuxEngine),
            monitor: map.connect(Channel::Monitor),
            in_topic: topics::MUX_IN,
            out_topic: topics::MUX_OUT,
        }
    }

    pub fn control(map: &ChannelMap) -> Self {
        Self {
            name: "control",
            kind: RelayKind::RouterRouter,
            client: map.bind(Channel::ControlClient),
            engine: map.bind(Channel::ControlEngine),
            monitor: map.connect(Channel::Monitor),
            in_topic: topics::CONTROL_IN,
            out_topic: topics::CONTROL_OUT,
        }
    }

    pub fn iopub(map: &ChannelMap) -> Self {
        Self {
            name: "iopub",
            kind: RelayKind::SubPub,
            client: map.bind(Channel::IopubClient),
            engine: map.bind(Channel::IopubEngine),
            monitor: map.connect(Channel::Monitor),
            in_topic: topics::IOPUB,
            out_topic: topics::IOPUB,
        }
    }

    /// Task channel for the `pure` scheme: no dependencies, no retries.
    pub fn pure_task(map: &ChannelMap) -> Self {
        Self {
            name: "task",
            kind: RelayKind::RouterDealer,
            client: map.bind(Channel::TaskClient),
            engine: map.bind(Channel::TaskEngine),
            monitor: map.connect(Channel::Monitor),
            in_topic: topics::TASK_IN,
            out_topic: topics::TASK_OUT,
        }
    }
}

/// Exchange the first two identities so a ROUTER-ROUTER hop addresses the
/// other peer: `[from, to, ...]` becomes `[to, from, ...]`.
pub fn swap_route(routed: &mut Routed) -> bool {
    if routed.idents.len() < 2 {
        return false;
    }
    routed.idents.swap(0, 1);
    true
}

pub struct MonitoredQueue {
    config: RelayConfig,
    metrics: RelayMetrics,
}

impl MonitoredQueue {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            metrics: RelayMetrics::default(),
        }
    }

    /// Count the message and copy it to the monitor.
    async fn tap(&self, monitor: &ZmqPublisher, topic: &'static str, routed: &Routed) {
        self.metrics.record(topic).await;
        if let Err(e) = monitor.publish_monitor(topic, routed).await {
            warn!(relay = self.config.name, error = %e, "monitor publish failed");
        }
    }

    async fn run_router_router(&self, shutdown: &Shutdown, monitor: &ZmqPublisher) -> Result<(), WireError> {
        let mut client = bind_router(&self.config.client).await?;
        let mut engine = bind_router(&self.config.engine).await?;
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                frames = recv_frames(&mut client) => {
                    let mut routed = match frames.and_then(Routed::from_frames) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(relay = self.config.name, error = %e, "bad client frames");
                            continue;
                        }
                    };
                    self.tap(monitor, self.config.in_topic, &routed).await;
                    if !swap_route(&mut routed) {
                        warn!(relay = self.config.name, "client request without destination dropped");
                        continue;
                    }
                    if let Err(e) = send_routed(&mut engine, &routed).await {
                        warn!(relay = self.config.name, error = %e, "forward to engine failed");
                    }
                }
                frames = recv_frames(&mut engine) => {
                    let mut routed = match frames.and_then(Routed::from_frames) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(relay = self.config.name, error = %e, "bad engine frames");
                            continue;
                        }
                    };
                    self.tap(monitor, self.config.out_topic, &routed).await;
                    if !swap_route(&mut routed) {
                        warn!(relay = self.config.name, "engine reply without destination dropped");
                        continue;
                    }
                    if let Err(e) = send_routed(&mut client, &routed).await {
                        warn!(relay = self.config.name, error = %e, "forward to client failed");
                    }
                }
            }
        }
    }

    async fn run_router_dealer(&self, shutdown: &Shutdown, monitor: &ZmqPublisher) -> Result<(), WireError> {
        let mut client = bind_router(&self.config.client).await?;
        let mut engine = bind_dealer(&self.config.engine).await?;
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                frames = recv_frames(&mut client) => {
                    let routed = match frames.and_then(Routed::from_frames) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(relay = self.config.name, error = %e, "bad client frames");
                            continue;
                        }
                    };
                    self.tap(monitor, self.config.in_topic, &routed).await;
                    if let Err(e) = send_routed(&mut engine, &routed).await {
                        warn!(relay = self.config.name, error = %e, "forward to engines failed");
                    }
                }
                frames = recv_frames(&mut engine) => {
                    let routed = match frames.and_then(Routed::from_frames) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(relay = self.config.name, error = %e, "bad engine frames");
                            continue;
                        }
                    };
                    self.tap(monitor, self.config.out_topic, &routed).await;
                    if let Err(e) = send_routed(&mut client, &routed).await {
                        warn!(relay = self.config.name, error = %e, "forward to client failed");
                    }
                }
            }
        }
    }

    async fn run_sub_pub(&self, shutdown: &Shutdown, monitor: &ZmqPublisher) -> Result<(), WireError> {
        let mut engine = bind_sub_all(&self.config.engine).await?;
        let mut client = bind_pub(&self.config.client).await?;
        loop {
            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                frames = recv_frames(&mut engine) => {
                    let frames = match frames {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(relay = self.config.name, error = %e, "iopub recv failed");
                            continue;
                        }
                    };
                    self.metrics.record(self.config.in_topic).await;
                    let mut copy = Vec::with_capacity(frames.len() + 1);
                    copy.push(self.config.in_topic.as_bytes().to_vec());
                    copy.extend(frames.iter().cloned());
                    if let Err(e) = monitor.publish_frames(copy).await {
                        warn!(relay = self.config.name, error = %e, "monitor publish failed");
                    }
                    if let Err(e) = send_frames(&mut client, frames).await {
                        warn!(relay = self.config.name, error = %e, "iopub forward failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Unit for MonitoredQueue {
    fn name(&self) -> &str {
        self.config.name
    }

    async fn run(&mut self, shutdown: Shutdown) -> Result<(), ControllerError> {
        let monitor = ZmqPublisher::connect(&self.config.monitor).await?;
        info!(
            relay = self.config.name,
            kind = ?self.config.kind,
            client = %self.config.client,
            engine = %self.config.engine,
            "relay running"
        );
        match self.config.kind {
            RelayKind::RouterRouter => self.run_router_router(&shutdown, &monitor).await?,
            RelayKind::RouterDealer => self.run_router_dealer(&shutdown, &monitor).await?,
            RelayKind::SubPub => self.run_sub_pub(&shutdown, &monitor).await?,
        }
        let total = self.metrics.total();
        let per_topic = self.metrics.counts().await;
        info!(
            relay = self.config.name,
            total = total,
            per_topic = ?per_topic,
            "relay stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kluster_wire::Message;

    #[test]
    fn swap_exchanges_sender_and_destination() {
        let mut routed = Routed::new(
            vec![b"client".to_vec(), b"engine".to_vec(), b"inner".to_vec()],
            Message::raw("apply_request", vec![]),
        );
        assert!(swap_route(&mut routed));
        assert_eq!(routed.idents[0], b"engine".to_vec());
        assert_eq!(routed.idents[1], b"client".to_vec());
        assert_eq!(routed.idents[2], b"inner".to_vec());
    }

    #[test]
    fn swap_needs_a_destination() {
        let mut routed = Routed::new(vec![b"client".to_vec()], Message::raw("apply_request", vec![]));
        assert!(!swap_route(&mut routed));
    }

    #[test]
    fn configs_pair_channels_with_topics() {
        let map = ChannelMap::local_tcp(21000, 1);
        let mux = RelayConfig::mux(&map);
        assert_eq!(mux.kind, RelayKind::RouterRouter);
        assert_eq!((mux.in_topic, mux.out_topic), (topics::MUX_IN, topics::MUX_OUT));
        assert_eq!(mux.client, map.bind(Channel::MuxClient));
        let pure = RelayConfig::pure_task(&map);
        assert_eq!(pure.kind, RelayKind::RouterDealer);
        assert_eq!(pure.engine, map.bind(Channel::TaskEngine));
        assert_eq!(RelayConfig::iopub(&map).kind, RelayKind::SubPub);
        assert_eq!(RelayConfig::control(&map).in_topic, topics::CONTROL_IN);
    }

    #[tokio::test]
    async fn metrics_count_per_topic() {
        let metrics = RelayMetrics::default();
        metrics.record("in").await;
        metrics.record("in").await;
        metrics.record("out").await;
        assert_eq!(metrics.total(), 3);
        assert_eq!(metrics.counts().await, vec![("in".to_string(), 2), ("out".to_string(), 1)]);
    }
}
