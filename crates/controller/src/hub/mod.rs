//! The hub: engine registration and liveness, the monitor tap feeding the
//! task history, and client queries about both.

pub mod core;
pub mod heartbeat;
pub mod registry;
pub mod runner;

pub use self::core::{Hub, HubAction, HubSettings};
pub use heartbeat::{HeartMonitor, Pong};
pub use registry::{EngineEntry, EngineRegistry, EngineStateFile, Liveness};
pub use runner::{HubSockets, HubUnit};
