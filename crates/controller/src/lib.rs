//! The kluster controller: hub, relay queues, task scheduler and broadcast
//! scheduler tree, each running as an independent [`Unit`].

pub mod broadcast;
pub mod controller;
pub mod db;
pub mod error;
pub mod hub;
pub mod relay;
pub mod scheduler;
pub mod sockets;
pub mod unit;

pub use broadcast::{BroadcastNode, BroadcastTree, BroadcastUnit};
pub use controller::Controller;
pub use db::{open_db, TaskDb};
pub use error::{ControllerError, DbError, RegistryError, SchedulerError};
pub use hub::{Hub, HubUnit};
pub use relay::{MonitoredQueue, RelayConfig, RelayKind, RelayMetrics};
pub use scheduler::{TaskScheduler, TaskSchedulerUnit, TaskScheme};
pub use unit::{Shutdown, Unit, UnitRunner, UnitRunnerConfig};
