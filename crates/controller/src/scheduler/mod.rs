//! Load-balanced task scheduling.
//!
//! [`TaskScheduler`] is a pure state machine fed with submissions, engine
//! replies, engine membership changes and clock ticks. [`TaskSchedulerUnit`]
//! wires it to the client and engine ROUTER sockets.

pub mod core;
pub mod dependency;
pub mod runner;
pub mod scheme;
pub mod task;

pub use self::core::{SchedulerAction, TaskScheduler};
pub use dependency::Dependency;
pub use runner::{TaskSchedulerSockets, TaskSchedulerUnit};
pub use scheme::{Candidate, LeastLoad, LoadScheme, Lru, TaskScheme};
pub use task::{Task, TaskOptions, TaskState};
