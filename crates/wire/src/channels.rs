//! Address plan for every socket a controller binds.
//!
//! TCP ports are allocated deterministically from `base_port`: the fixed
//! channels first, then one inbound port per broadcast node, then one
//! engine-facing port per broadcast leaf. IPC names carry the cluster stem so
//! two clusters on one host never collide.

use std::collections::HashMap;
use std::fmt;

use kluster_core::{KlusterError, TransportConfig};

use crate::transport::Transport;

/// One controller socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Registration,
    HbPing,
    HbPong,
    ControlClient,
    ControlEngine,
    MuxClient,
    MuxEngine,
    TaskClient,
    TaskEngine,
    IopubClient,
    IopubEngine,
    Notification,
    Monitor,
    /// Inbound ROUTER of broadcast node `i` (node 0 faces clients).
    BroadcastNode(u32),
    /// Engine-facing ROUTER of broadcast leaf `j`.
    BroadcastLeaf(u32),
}

const FIXED: [Channel; 13] = [
    Channel::Registration,
    Channel::HbPing,
    Channel::HbPong,
    Channel::ControlClient,
    Channel::ControlEngine,
    Channel::MuxClient,
    Channel::MuxEngine,
    Channel::TaskClient,
    Channel::TaskEngine,
    Channel::IopubClient,
    Channel::IopubEngine,
    Channel::Notification,
    Channel::Monitor,
];

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => f.write_str("registration"),
            Self::HbPing => f.write_str("hb-ping"),
            Self::HbPong => f.write_str("hb-pong"),
            Self::ControlClient => f.write_str("control-client"),
            Self::ControlEngine => f.write_str("control-engine"),
            Self::MuxClient => f.write_str("mux-client"),
            Self::MuxEngine => f.write_str("mux-engine"),
            Self::TaskClient => f.write_str("task-client"),
            Self::TaskEngine => f.write_str("task-engine"),
            Self::IopubClient => f.write_str("iopub-client"),
            Self::IopubEngine => f.write_str("iopub-engine"),
            Self::Notification => f.write_str("notification"),
            Self::Monitor => f.write_str("monitor"),
            Self::BroadcastNode(i) => write!(f, "bcast-node-{i}"),
            Self::BroadcastLeaf(j) => write!(f, "bcast-leaf-{j}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Tcp { bind_ip: String, location: String },
    Ipc { prefix: String },
}

/// Resolves [`Channel`]s to bind and connect [`Transport`]s.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    kind: Kind,
    base_port: u16,
    broadcast_depth: u32,
    overrides: HashMap<Channel, Transport>,
}

impl ChannelMap {
    pub fn new(
        transport: &TransportConfig,
        cluster_stem: &str,
        broadcast_depth: u32,
    ) -> Result<Self, KlusterError> {
        let kind = match transport.kind.as_str() {
            "tcp" => Kind::Tcp {
                bind_ip: transport.ip.clone(),
                location: transport.advertised_location().to_string(),
            },
            "ipc" => Kind::Ipc {
                prefix: cluster_stem.to_string(),
            },
            other => {
                return Err(KlusterError::Config(format!(
                    "invalid transport kind '{other}'"
                )))
            }
        };
        let map = Self {
            kind,
            base_port: transport.base_port,
            broadcast_depth,
            overrides: HashMap::new(),
        };
        if let Kind::Tcp { .. } = map.kind {
            let needed = map.port_count();
            if usize::from(map.base_port) + needed > usize::from(u16::MAX) {
                return Err(KlusterError::Config(format!(
                    "base_port {} leaves no room for {needed} ports",
                    map.base_port
                )));
            }
        }
        Ok(map)
    }

    /// Localhost TCP map, used by tests and single-host setups.
    pub fn local_tcp(base_port: u16, broadcast_depth: u32) -> Self {
        Self {
            kind: Kind::Tcp {
                bind_ip: "127.0.0.1".into(),
                location: "127.0.0.1".into(),
            },
            base_port,
            broadcast_depth,
            overrides: HashMap::new(),
        }
    }

    pub fn broadcast_depth(&self) -> u32 {
        self.broadcast_depth
    }

    pub fn broadcast_node_count(&self) -> u32 {
        (1u32 << (self.broadcast_depth + 1)) - 1
    }

    pub fn broadcast_leaf_count(&self) -> u32 {
        1u32 << self.broadcast_depth
    }

    /// Number of TCP ports this plan occupies.
    pub fn port_count(&self) -> usize {
        FIXED.len() + self.broadcast_node_count() as usize + self.broadcast_leaf_count() as usize
    }

    /// Pin a channel to an explicit address, e.g. one read back from a
    /// connection file.
    pub fn set_override(&mut self, channel: Channel, transport: Transport) {
        self.overrides.insert(channel, transport);
    }

    fn offset(&self, channel: Channel) -> usize {
        match channel {
            Channel::BroadcastNode(i) => FIXED.len() + i as usize,
            Channel::BroadcastLeaf(j) => {
                FIXED.len() + self.broadcast_node_count() as usize + j as usize
            }
            fixed => FIXED.iter().position(|c| *c == fixed).unwrap_or(0),
        }
    }

    fn resolve(&self, channel: Channel, host_of: impl Fn(&Kind) -> Option<&str>) -> Transport {
        if let Some(t) = self.overrides.get(&channel) {
            return match host_of(&self.kind) {
                Some(host) => t.with_host(host),
                None => t.clone(),
            };
        }
        match &self.kind {
            Kind::Tcp { .. } => {
                let host = host_of(&self.kind).unwrap_or("127.0.0.1");
                let port = self.base_port as usize + self.offset(channel);
                Transport::tcp(host, port as u16)
            }
            Kind::Ipc { prefix } => Transport::ipc(&format!("{prefix}-{channel}")),
        }
    }

    /// Address to bind on.
    pub fn bind(&self, channel: Channel) -> Transport {
        self.resolve(channel, |k| match k {
            Kind::Tcp { bind_ip, .. } => Some(bind_ip.as_str()),
            Kind::Ipc { .. } => None,
        })
    }

    /// Address peers connect to.
    pub fn connect(&self, channel: Channel) -> Transport {
        self.resolve(channel, |k| match k {
            Kind::Tcp { location, .. } => Some(location.as_str()),
            Kind::Ipc { .. } => None,
        })
    }

    pub fn location(&self) -> &str {
        match &self.kind {
            Kind::Tcp { location, .. } => location,
            Kind::Ipc { .. } => "localhost",
        }
    }

    /// Interface prefix as recorded in connection files (`tcp://10.0.0.5`).
    pub fn interface(&self) -> String {
        match &self.kind {
            Kind::Tcp { location, .. } => format!("tcp://{location}"),
            Kind::Ipc { .. } => "ipc".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_ports_are_contiguous_and_distinct() {
        let map = ChannelMap::local_tcp(20000, 1);
        assert_eq!(map.bind(Channel::Registration), Transport::tcp("127.0.0.1", 20000));
        assert_eq!(map.bind(Channel::Monitor), Transport::tcp("127.0.0.1", 20012));
        // depth 1: 3 nodes, 2 leaves
        assert_eq!(map.bind(Channel::BroadcastNode(0)), Transport::tcp("127.0.0.1", 20013));
        assert_eq!(map.bind(Channel::BroadcastNode(2)), Transport::tcp("127.0.0.1", 20015));
        assert_eq!(map.bind(Channel::BroadcastLeaf(0)), Transport::tcp("127.0.0.1", 20016));
        assert_eq!(map.bind(Channel::BroadcastLeaf(1)), Transport::tcp("127.0.0.1", 20017));
        assert_eq!(map.port_count(), 18);
    }

    #[test]
    fn bind_and_connect_hosts_differ() {
        let cfg = TransportConfig {
            ip: "0.0.0.0".into(),
            location: Some("head".into()),
            ..TransportConfig::default()
        };
        let map = ChannelMap::new(&cfg, "kluster", 0).unwrap();
        let bind = map.bind(Channel::MuxClient);
        let connect = map.connect(Channel::MuxClient);
        assert!(bind.endpoint().starts_with("tcp://0.0.0.0:"));
        assert!(connect.endpoint().starts_with("tcp://head:"));
        assert_eq!(map.interface(), "tcp://head");
    }

    #[test]
    fn ipc_names_carry_cluster_stem() {
        let cfg = TransportConfig {
            kind: "ipc".into(),
            ..TransportConfig::default()
        };
        let map = ChannelMap::new(&cfg, "kluster-c1", 1).unwrap();
        assert_eq!(
            map.bind(Channel::BroadcastLeaf(1)).endpoint(),
            "ipc:///tmp/kluster/kluster-c1-bcast-leaf-1.sock"
        );
    }

    #[test]
    fn override_keeps_port_but_follows_host() {
        let mut map = ChannelMap::local_tcp(20000, 0);
        map.set_override(Channel::Registration, Transport::tcp("oldhost", 31000));
        assert_eq!(map.connect(Channel::Registration), Transport::tcp("127.0.0.1", 31000));
    }

    #[test]
    fn base_port_overflow_is_rejected() {
        let cfg = TransportConfig {
            base_port: 65530,
            ..TransportConfig::default()
        };
        assert!(ChannelMap::new(&cfg, "kluster", 1).is_err());
    }
}
