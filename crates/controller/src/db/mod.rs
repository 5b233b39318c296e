//! Task history kept by the hub.
//!
//! The hub writes one [`TaskRecord`] per request it sees on the monitor feed
//! and fills it in as the task is dispatched and answered. Backends only
//! store records; all bookkeeping lives in the hub.

mod file;
mod memory;
mod nodb;

use std::path::Path;

use chrono::{DateTime, Utc};
use kluster_core::{EngineId, KlusterError};
use kluster_wire::messages::TaskRecord;
use uuid::Uuid;

use crate::error::{ControllerError, DbError};

pub use file::JsonFileDb;
pub use memory::MemoryDb;
pub use nodb::NoDb;

/// Partial update applied to an existing record; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub client_ident: Option<String>,
    pub engine_id: Option<EngineId>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub result_msg_id: Option<Uuid>,
    pub result_payload: Option<Vec<u8>>,
}

impl RecordUpdate {
    pub fn apply(self, record: &mut TaskRecord) {
        if self.client_ident.is_some() {
            record.client_ident = self.client_ident;
        }
        if self.engine_id.is_some() {
            record.engine_id = self.engine_id;
        }
        if self.started.is_some() {
            record.started = self.started;
        }
        if self.completed.is_some() {
            record.completed = self.completed;
        }
        if self.status.is_some() {
            record.status = self.status;
        }
        if self.result_msg_id.is_some() {
            record.result_msg_id = self.result_msg_id;
        }
        if self.result_payload.is_some() {
            record.result_payload = self.result_payload;
        }
    }
}

/// Storage for task records.
pub trait TaskDb: Send {
    fn name(&self) -> &'static str;

    /// False for backends that drop everything; queries against them fail.
    fn keeps_history(&self) -> bool {
        true
    }

    fn add_record(&mut self, record: TaskRecord) -> Result<(), DbError>;

    fn update_record(&mut self, msg_id: Uuid, update: RecordUpdate) -> Result<(), DbError>;

    fn get_record(&self, msg_id: &Uuid) -> Result<Option<TaskRecord>, DbError>;

    /// Returns whether a record was removed.
    fn drop_record(&mut self, msg_id: &Uuid) -> Result<bool, DbError>;

    /// Every stored id, oldest submission first.
    fn record_ids(&self) -> Result<Vec<Uuid>, DbError>;
}

/// Open the backend named in `controller.db`.
pub fn open_db(kind: &str, path: &Path) -> Result<Box<dyn TaskDb>, ControllerError> {
    match kind {
        "nodb" | "none" => Ok(Box::new(NoDb)),
        "memory" => Ok(Box::new(MemoryDb::new())),
        "file" | "json" => Ok(Box::new(JsonFileDb::open(path)?)),
        other => Err(KlusterError::Config(format!(
            "unknown task db '{other}', expected nodb, memory or file"
        ))
        .into()),
    }
}
