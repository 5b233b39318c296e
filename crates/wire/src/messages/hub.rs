use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kluster_core::EngineId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Sent by an engine on the registration socket.
///
/// `ident` is the routing identity the engine uses on every other socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub status: ReplyStatus,
    pub engine_id: Option<EngineId>,
    /// Broadcast leaf the engine must connect to.
    pub broadcast_leaf: Option<u32>,
    pub heartbeat_period_ms: u64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregistrationRequest {
    pub engine_id: EngineId,
}

/// Payload of registration and unregistration notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineNotification {
    pub engine_id: EngineId,
    pub ident: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReply {
    pub engines: BTreeMap<EngineId, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    /// Restrict to these engines; all when `None`.
    #[serde(default)]
    pub targets: Option<Vec<EngineId>>,
    /// Return message ids instead of counts.
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineQueueStatus {
    pub queue: usize,
    pub completed: usize,
    pub tasks: usize,
    #[serde(default)]
    pub queue_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub completed_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReply {
    pub engines: BTreeMap<EngineId, EngineQueueStatus>,
    /// Tasks submitted to the scheduler but not yet assigned.
    pub unassigned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRequest {
    pub msg_ids: Vec<Uuid>,
}

/// Hub-side view of one task, as kept in the task database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub msg_id: Uuid,
    pub msg_type: String,
    /// Which relay saw the request: "mux", "task", "control" or "broadcast".
    pub queue: String,
    #[serde(default)]
    pub client_ident: Option<String>,
    #[serde(default)]
    pub engine_id: Option<EngineId>,
    pub submitted: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result_msg_id: Option<Uuid>,
    #[serde(default)]
    pub result_payload: Option<Vec<u8>>,
}

impl TaskRecord {
    pub fn new(msg_id: Uuid, msg_type: &str, queue: &str, submitted: DateTime<Utc>) -> Self {
        Self {
            msg_id,
            msg_type: msg_type.to_string(),
            queue: queue.to_string(),
            client_ident: None,
            engine_id: None,
            submitted,
            started: None,
            completed: None,
            status: None,
            result_msg_id: None,
            result_payload: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultReply {
    /// Known but unfinished.
    pub pending: Vec<Uuid>,
    pub completed: Vec<Uuid>,
    /// Ids the hub has never seen.
    pub unknown: Vec<Uuid>,
    pub records: BTreeMap<Uuid, TaskRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryReply {
    pub msg_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub msg_ids: Vec<Uuid>,
    /// Drop every finished result executed on these engines.
    #[serde(default)]
    pub engine_ids: Vec<EngineId>,
    /// Drop every finished result.
    #[serde(default)]
    pub all: bool,
}

/// Generic acknowledgement for requests without a richer reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl StatusReply {
    pub fn ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            reason: Some(reason.into()),
        }
    }
}
