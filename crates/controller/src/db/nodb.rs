use kluster_wire::messages::TaskRecord;
use uuid::Uuid;

use super::{RecordUpdate, TaskDb};
use crate::error::DbError;

/// Backend that keeps nothing. The default: most clusters never query history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDb;

impl TaskDb for NoDb {
    fn name(&self) -> &'static str {
        "nodb"
    }

    fn keeps_history(&self) -> bool {
        false
    }

    fn add_record(&mut self, _record: TaskRecord) -> Result<(), DbError> {
        Ok(())
    }

    fn update_record(&mut self, _msg_id: Uuid, _update: RecordUpdate) -> Result<(), DbError> {
        Ok(())
    }

    fn get_record(&self, _msg_id: &Uuid) -> Result<Option<TaskRecord>, DbError> {
        Ok(None)
    }

    fn drop_record(&mut self, _msg_id: &Uuid) -> Result<bool, DbError> {
        Ok(false)
    }

    fn record_ids(&self) -> Result<Vec<Uuid>, DbError> {
        Ok(Vec::new())
    }
}
