//! Controller bootstrap: resolves every channel, writes the connection
//! files and assembles the hub, relays, task scheduler and broadcast tree
//! into one set of units.

use std::path::PathBuf;
use std::time::Instant;

use kluster_core::{ClusterConfig, ProfileDir};
use kluster_wire::{Channel, ChannelMap, ConnectionInfo, Side};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastNode, BroadcastSockets, BroadcastTree, BroadcastUnit};
use crate::db::open_db;
use crate::error::ControllerError;
use crate::hub::{EngineRegistry, EngineStateFile, Hub, HubSettings, HubSockets, HubUnit};
use crate::relay::{MonitoredQueue, RelayConfig};
use crate::scheduler::{TaskScheduler, TaskSchedulerSockets, TaskSchedulerUnit, TaskScheme};
use crate::unit::{Shutdown, Unit, UnitRunner, UnitRunnerConfig};

pub struct Controller {
    config: ClusterConfig,
    profile: ProfileDir,
    map: ChannelMap,
    scheme: TaskScheme,
    key: String,
    client_file: PathBuf,
    engine_file: PathBuf,
}

impl Controller {
    /// Resolve addresses, reusing the ports and key of existing connection
    /// files when `controller.reuse_files` is set.
    pub fn new(config: ClusterConfig) -> Result<Self, ControllerError> {
        let profile = ProfileDir::new(&config.cluster.profile_dir);
        profile.ensure()?;
        let cluster_id = config.cluster.cluster_id.as_str();
        let scheme: TaskScheme = config.controller.scheme.parse()?;
        let stem = ProfileDir::cluster_file_stem("kluster", cluster_id);
        let mut map = ChannelMap::new(&config.transport, &stem, config.controller.broadcast_depth)?;

        let client_file = profile.connection_file(cluster_id, Side::Client.as_str());
        let engine_file = profile.connection_file(cluster_id, Side::Engine.as_str());

        let key = if config.controller.reuse_files && client_file.is_file() && engine_file.is_file() {
            let client = ConnectionInfo::read(&client_file)?;
            let engine = ConnectionInfo::read(&engine_file)?;
            client.check_compatible(&engine)?;
            client.apply_to(&mut map, Side::Client)?;
            engine.apply_to(&mut map, Side::Engine)?;
            info!(path = %client_file.display(), "reusing connection files");
            client.key
        } else {
            Uuid::new_v4().to_string()
        };

        Ok(Self {
            config,
            profile,
            map,
            scheme,
            key,
            client_file,
            engine_file,
        })
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.map
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn scheme(&self) -> TaskScheme {
        self.scheme
    }

    pub fn connection_file(&self, side: Side) -> &PathBuf {
        match side {
            Side::Client => &self.client_file,
            Side::Engine => &self.engine_file,
        }
    }

    pub fn connection_info(&self, side: Side) -> ConnectionInfo {
        ConnectionInfo::from_channels(
            &self.map,
            side,
            &self.key,
            &self.config.controller.signature_scheme,
            self.config.transport.ssh.clone(),
            Some(self.scheme.to_string()),
        )
    }

    pub fn write_connection_files(&self) -> Result<(), ControllerError> {
        self.connection_info(Side::Client).write(&self.client_file)?;
        self.connection_info(Side::Engine).write(&self.engine_file)?;
        Ok(())
    }

    pub fn remove_connection_files(&self) {
        for path in [&self.client_file, &self.engine_file] {
            if let Err(e) = ConnectionInfo::remove(path) {
                warn!(path = %path.display(), error = %e, "failed to remove connection file");
            }
        }
    }

    fn db_path(&self) -> PathBuf {
        self.config.controller.db_path.clone().unwrap_or_else(|| {
            let stem = ProfileDir::cluster_file_stem("tasks", &self.config.cluster.cluster_id);
            self.profile.db_dir().join(format!("{stem}.json"))
        })
    }

    fn build_hub(&self) -> Result<HubUnit, ControllerError> {
        let controller = &self.config.controller;
        let state_path = self.profile.engine_state_file(&self.config.cluster.cluster_id);
        let registry = if controller.restore_engines && state_path.is_file() {
            let state = EngineStateFile::load(&state_path)?;
            info!(engines = state.engines.len(), path = %state_path.display(), "restoring engine table");
            EngineRegistry::restore(state, Instant::now())
        } else {
            EngineRegistry::new()
        };
        let db = open_db(&controller.db, &self.db_path())?;
        info!(db = db.name(), "task db opened");
        let hub = Hub::new(HubSettings::from_config(controller), registry, db);
        Ok(HubUnit::new(
            HubSockets::from_map(&self.map),
            hub,
            controller.heartbeat_period(),
            controller.restore_engines.then_some(state_path),
        ))
    }

    /// Every unit of this controller, hub first.
    pub fn build_units(&self) -> Result<Vec<Box<dyn Unit>>, ControllerError> {
        let controller = &self.config.controller;
        let mut units: Vec<Box<dyn Unit>> = vec![
            Box::new(self.build_hub()?),
            Box::new(MonitoredQueue::new(RelayConfig::mux(&self.map))),
            Box::new(MonitoredQueue::new(RelayConfig::control(&self.map))),
            Box::new(MonitoredQueue::new(RelayConfig::iopub(&self.map))),
        ];

        match self.scheme {
            TaskScheme::Pure => units.push(Box::new(MonitoredQueue::new(RelayConfig::pure_task(&self.map)))),
            TaskScheme::None => info!("task channel disabled"),
            scheme => {
                if let Some(load) = scheme.load_scheme() {
                    let sockets = TaskSchedulerSockets {
                        client: self.map.bind(Channel::TaskClient),
                        engine: self.map.bind(Channel::TaskEngine),
                        notification: self.map.connect(Channel::Notification),
                        monitor: self.map.connect(Channel::Monitor),
                    };
                    units.push(Box::new(TaskSchedulerUnit::new(
                        sockets,
                        TaskScheduler::new(load, controller.hwm),
                    )));
                }
            }
        }

        let slots = u32::try_from(controller.broadcast_slots).unwrap_or(u32::MAX);
        let tree = BroadcastTree::build(controller.broadcast_depth, slots);
        for id in 0..tree.node_count() {
            let node = BroadcastNode::new(tree.clone(), id, controller.broadcast_timeout())?;
            units.push(Box::new(BroadcastUnit::new(
                BroadcastSockets::from_map(&self.map, &tree, id),
                node,
            )));
        }
        Ok(units)
    }

    /// Write connection files, run every unit until shutdown, then clean up.
    pub async fn run(self, shutdown: Shutdown, runner: UnitRunnerConfig) -> Result<(), ControllerError> {
        let units = self.build_units()?;
        self.write_connection_files()?;
        info!(
            scheme = %self.scheme,
            units = units.len(),
            location = self.map.location(),
            "controller starting"
        );
        let result = UnitRunner::run(units, shutdown, runner).await;
        if self.config.controller.reuse_files {
            info!("keeping connection files for reuse");
        } else {
            self.remove_connection_files();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.cluster.profile_dir = dir.to_path_buf();
        config.transport.base_port = 23100;
        config
    }

    fn unit_names(units: &[Box<dyn Unit>]) -> Vec<String> {
        units.iter().map(|u| u.name().to_string()).collect()
    }

    #[test]
    fn default_scheme_runs_scheduler_and_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(config(dir.path())).unwrap();
        let names = unit_names(&controller.build_units().unwrap());
        assert_eq!(names[0], "hub");
        assert!(names.contains(&"task-scheduler".to_string()));
        assert!(names.contains(&"mux".to_string()));
        assert_eq!(names.iter().filter(|n| n.starts_with("broadcast-")).count(), 3);
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn pure_and_none_schemes_replace_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.controller.scheme = "pure".into();
        let names = unit_names(&Controller::new(cfg.clone()).unwrap().build_units().unwrap());
        assert!(names.contains(&"task".to_string()));
        assert!(!names.contains(&"task-scheduler".to_string()));

        cfg.controller.scheme = "none".into();
        let names = unit_names(&Controller::new(cfg).unwrap().build_units().unwrap());
        assert!(!names.contains(&"task".to_string()));
        assert!(!names.contains(&"task-scheduler".to_string()));
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.controller.scheme = "fastest".into();
        assert!(matches!(Controller::new(cfg), Err(ControllerError::Kluster(_))));
    }

    #[test]
    fn connection_files_are_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(config(dir.path())).unwrap();
        controller.write_connection_files().unwrap();

        let client = ConnectionInfo::read(controller.connection_file(Side::Client)).unwrap();
        let engine = ConnectionInfo::read(controller.connection_file(Side::Engine)).unwrap();
        assert_eq!(client.key, controller.key());
        assert_eq!(client.registration, engine.registration);
        assert!(client.broadcast.is_some());
        assert!(engine.broadcast.is_none());
        assert_eq!(client.task_scheme.as_deref(), Some("leastload"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(controller.connection_file(Side::Client))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        controller.remove_connection_files();
        assert!(!controller.connection_file(Side::Client).exists());
        assert!(!controller.connection_file(Side::Engine).exists());
    }

    #[test]
    fn reuse_keeps_key_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let first = Controller::new(config(dir.path())).unwrap();
        first.write_connection_files().unwrap();

        let mut cfg = config(dir.path());
        cfg.controller.reuse_files = true;
        cfg.transport.base_port = 24100;
        let second = Controller::new(cfg).unwrap();
        assert_eq!(second.key(), first.key());
        assert_eq!(
            second.channel_map().connect(Channel::MuxClient),
            first.channel_map().connect(Channel::MuxClient)
        );
        assert_eq!(
            second.channel_map().connect(Channel::Registration),
            first.channel_map().connect(Channel::Registration)
        );
    }

    #[test]
    fn fresh_start_without_reuse_picks_a_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let first = Controller::new(config(dir.path())).unwrap();
        first.write_connection_files().unwrap();
        let second = Controller::new(config(dir.path())).unwrap();
        assert_ne!(second.key(), first.key());
    }

    #[test]
    fn restored_engine_table_keeps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.controller.restore_engines = true;
        let profile = ProfileDir::new(dir.path());
        profile.ensure().unwrap();
        let mut state = EngineStateFile::default();
        state.next_id = 4;
        state.engines.insert(kluster_core::EngineId(3), "e-3".into());
        state.save(&profile.engine_state_file("")).unwrap();

        let controller = Controller::new(cfg).unwrap();
        let hub = controller.build_hub().unwrap();
        assert_eq!(hub.hub().registry().id_of("e-3"), Some(kluster_core::EngineId(3)));
    }
}
