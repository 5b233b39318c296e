use std::collections::HashMap;

use kluster_wire::messages::TaskRecord;
use uuid::Uuid;

use super::{RecordUpdate, TaskDb};
use crate::error::DbError;

#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    records: HashMap<Uuid, TaskRecord>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.msg_id, r)).collect(),
        }
    }

    /// Records in submission order.
    pub(crate) fn ordered(&self) -> Vec<&TaskRecord> {
        let mut records: Vec<&TaskRecord> = self.records.values().collect();
        records.sort_by_key(|r| (r.submitted, r.msg_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl TaskDb for MemoryDb {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn add_record(&mut self, record: TaskRecord) -> Result<(), DbError> {
        self.records.insert(record.msg_id, record);
        Ok(())
    }

    fn update_record(&mut self, msg_id: Uuid, update: RecordUpdate) -> Result<(), DbError> {
        let record = self.records.get_mut(&msg_id).ok_or(DbError::NotFound(msg_id))?;
        update.apply(record);
        Ok(())
    }

    fn get_record(&self, msg_id: &Uuid) -> Result<Option<TaskRecord>, DbError> {
        Ok(self.records.get(msg_id).cloned())
    }

    fn drop_record(&mut self, msg_id: &Uuid) -> Result<bool, DbError> {
        Ok(self.records.remove(msg_id).is_some())
    }

    fn record_ids(&self) -> Result<Vec<Uuid>, DbError> {
        Ok(self.ordered().into_iter().map(|r| r.msg_id).collect())
    }
}
