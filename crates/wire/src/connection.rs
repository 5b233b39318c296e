//! Connection files: the JSON documents engines and clients read to find a
//! controller.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channels::{Channel, ChannelMap};
use crate::error::WireError;

/// Contents of `<stem>-client.json` or `<stem>-engine.json`.
///
/// Every socket field is a full endpoint URL so files are meaningful for
/// both TCP and IPC deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub key: String,
    pub location: String,
    pub interface: String,
    pub registration: String,
    pub hb_ping: String,
    pub hb_pong: String,
    pub control: String,
    pub mux: String,
    pub task: String,
    pub iopub: String,
    pub notification: String,
    #[serde(default)]
    pub broadcast: Option<String>,
    #[serde(default)]
    pub ssh: Option<String>,
    pub signature_scheme: String,
    pub pack: String,
    pub unpack: String,
    #[serde(default)]
    pub task_scheme: Option<String>,
}

/// Which side of the controller a file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Engine,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Engine => "engine",
        }
    }

    /// Per-side channels in field order: control, mux, task, iopub, notification.
    fn channels(self) -> [Channel; 5] {
        match self {
            Self::Client => [
                Channel::ControlClient,
                Channel::MuxClient,
                Channel::TaskClient,
                Channel::IopubClient,
                Channel::Notification,
            ],
            Self::Engine => [
                Channel::ControlEngine,
                Channel::MuxEngine,
                Channel::TaskEngine,
                Channel::IopubEngine,
                Channel::Notification,
            ],
        }
    }
}

impl ConnectionInfo {
    /// Describe `map` as seen from `side`.
    pub fn from_channels(
        map: &ChannelMap,
        side: Side,
        key: &str,
        signature_scheme: &str,
        ssh: Option<String>,
        task_scheme: Option<String>,
    ) -> Self {
        let url = |c: Channel| map.connect(c).endpoint();
        let [control, mux, task, iopub, notification] = side.channels().map(url);
        Self {
            key: key.to_string(),
            location: map.location().to_string(),
            interface: map.interface(),
            registration: url(Channel::Registration),
            hb_ping: url(Channel::HbPing),
            hb_pong: url(Channel::HbPong),
            control,
            mux,
            task,
            iopub,
            notification,
            broadcast: match side {
                Side::Client => Some(url(Channel::BroadcastNode(0))),
                Side::Engine => None,
            },
            ssh,
            signature_scheme: signature_scheme.to_string(),
            pack: "msgpack".into(),
            unpack: "msgpack".into(),
            task_scheme,
        }
    }

    /// Pin the channel map to the addresses recorded in this file.
    pub fn apply_to(&self, map: &mut ChannelMap, side: Side) -> Result<(), WireError> {
        let mut pin = |channel: Channel, url: &str| -> Result<(), WireError> {
            let t = crate::Transport::parse(url).ok_or_else(|| {
                WireError::Connection(format!("unparseable endpoint '{url}' for {channel}"))
            })?;
            map.set_override(channel, t);
            Ok(())
        };
        pin(Channel::Registration, self.registration.as_str())?;
        pin(Channel::HbPing, self.hb_ping.as_str())?;
        pin(Channel::HbPong, self.hb_pong.as_str())?;
        if let (Side::Client, Some(b)) = (side, &self.broadcast) {
            pin(Channel::BroadcastNode(0), b.as_str())?;
        }
        let urls = [
            &self.control,
            &self.mux,
            &self.task,
            &self.iopub,
            &self.notification,
        ];
        for (channel, url) in side.channels().into_iter().zip(urls) {
            pin(channel, url.as_str())?;
        }
        Ok(())
    }

    /// Fields that must agree between a reused file and the running controller.
    pub fn check_compatible(&self, other: &Self) -> Result<(), WireError> {
        let checks = [
            ("key", &self.key, &other.key),
            ("registration", &self.registration, &other.registration),
            ("pack", &self.pack, &other.pack),
            ("unpack", &self.unpack, &other.unpack),
            ("signature_scheme", &self.signature_scheme, &other.signature_scheme),
        ];
        for (name, a, b) in checks {
            if a != b {
                return Err(WireError::Connection(format!(
                    "connection files disagree on {name}: '{a}' vs '{b}'"
                )));
            }
        }
        Ok(())
    }

    /// Write the file readable by the owner only.
    pub fn write(&self, path: &Path) -> Result<(), WireError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(path)?;
        file.write_all(&json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(path = %path.display(), "wrote connection file");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, WireError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove a connection file, ignoring one that is already gone.
    pub fn remove(path: &Path) -> Result<(), WireError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed connection file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(side: Side) -> ConnectionInfo {
        let map = ChannelMap::local_tcp(21000, 1);
        ConnectionInfo::from_channels(&map, side, "k3y", "none", None, Some("leastload".into()))
    }

    #[test]
    fn client_and_engine_files_share_hub_sockets() {
        let client = sample(Side::Client);
        let engine = sample(Side::Engine);
        assert_eq!(client.registration, engine.registration);
        assert_eq!(client.hb_ping, engine.hb_ping);
        assert_ne!(client.mux, engine.mux);
        assert!(client.broadcast.is_some());
        assert!(engine.broadcast.is_none());
        client.check_compatible(&engine).unwrap();
    }

    #[test]
    fn json_has_every_documented_key() {
        let value = serde_json::to_value(sample(Side::Client)).unwrap();
        for key in [
            "key", "location", "interface", "registration", "hb_ping", "hb_pong", "control",
            "mux", "task", "iopub", "notification", "ssh", "signature_scheme", "pack", "unpack",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security").join("kluster-client.json");
        let info = sample(Side::Client);
        info.write(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert_eq!(ConnectionInfo::read(&path).unwrap(), info);
        ConnectionInfo::remove(&path).unwrap();
        assert!(!path.exists());
        ConnectionInfo::remove(&path).unwrap();
    }

    #[test]
    fn apply_to_pins_recorded_ports() {
        let old = sample(Side::Engine);
        let mut map = ChannelMap::local_tcp(30000, 1);
        old.apply_to(&mut map, Side::Engine).unwrap();
        assert_eq!(map.connect(Channel::MuxEngine).endpoint(), old.mux);
        assert_eq!(map.connect(Channel::Registration).endpoint(), old.registration);
    }

    #[test]
    fn mismatched_key_is_incompatible() {
        let a = sample(Side::Client);
        let mut b = a.clone();
        b.key = "other".into();
        assert!(a.check_compatible(&b).is_err());
    }
}
