use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use kluster_core::EngineId;
use kluster_wire::messages::meta;
use kluster_wire::{Message, Routed};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::dependency::Dependency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Assigned(EngineId),
}

/// Scheduling options read from request metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub follow: Dependency,
    pub after: Dependency,
    pub retries: u32,
    pub timeout: Option<Duration>,
    pub targets: Option<BTreeSet<EngineId>>,
}

impl TaskOptions {
    pub fn from_message(msg: &Message) -> Result<Self, SchedulerError> {
        Ok(Self {
            follow: Dependency::from_value(msg.meta(meta::FOLLOW))?,
            after: Dependency::from_value(msg.meta(meta::AFTER))?,
            retries: parse_retries(msg.meta(meta::RETRIES))?,
            timeout: parse_timeout(msg.meta(meta::TIMEOUT))?,
            targets: parse_targets(msg.meta(meta::TARGETS))?,
        })
    }
}

fn parse_retries(value: Option<&Value>) -> Result<u32, SchedulerError> {
    match value {
        None => Ok(0),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                SchedulerError::InvalidRequest(format!(
                    "retries must be a non-negative integer, got {v}"
                ))
            }),
    }
}

fn parse_timeout(value: Option<&Value>) -> Result<Option<Duration>, SchedulerError> {
    let Some(v) = value else {
        return Ok(None);
    };
    match v.as_f64() {
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        // zero means no timeout
        Some(secs) if secs == 0.0 => Ok(None),
        _ => Err(SchedulerError::InvalidRequest(format!(
            "timeout must be a non-negative number of seconds, got {v}"
        ))),
    }
}

fn parse_targets(value: Option<&Value>) -> Result<Option<BTreeSet<EngineId>>, SchedulerError> {
    let Some(v) = value else {
        return Ok(None);
    };
    let one = |v: &Value| -> Result<EngineId, SchedulerError> {
        v.as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(EngineId)
            .ok_or_else(|| SchedulerError::InvalidRequest(format!("bad engine id {v} in targets")))
    };
    match v {
        Value::Array(items) if items.is_empty() => Ok(None),
        Value::Array(items) => items.iter().map(one).collect::<Result<_, _>>().map(Some),
        single => Ok(Some(BTreeSet::from([one(single)?]))),
    }
}

/// A load-balanced task owned by the scheduler until it finishes.
#[derive(Debug, Clone)]
pub struct Task {
    pub msg_id: Uuid,
    /// Client identity stack plus the original request.
    pub request: Routed,
    pub options: TaskOptions,
    /// Submission order; the pending queue is scanned in this order.
    pub arrival: u64,
    pub state: TaskState,
    pub submitted: Instant,
    pub deadline: Option<Instant>,
    pub attempts: u32,
    /// Engines this task timed out on.
    pub blacklist: BTreeSet<EngineId>,
}

impl Task {
    pub fn new(request: Routed, options: TaskOptions, arrival: u64, now: Instant) -> Self {
        let deadline = options.timeout.map(|t| now + t);
        Self {
            msg_id: request.message.msg_id,
            request,
            options,
            arrival,
            state: TaskState::Pending,
            submitted: now,
            deadline,
            attempts: 0,
            blacklist: BTreeSet::new(),
        }
    }

    pub fn restart_clock(&mut self, now: Instant) {
        self.deadline = self.options.timeout.map(|t| now + t);
    }

    pub fn assigned_to(&self) -> Option<EngineId> {
        match self.state {
            TaskState::Assigned(e) => Some(e),
            TaskState::Pending => None,
        }
    }
}
