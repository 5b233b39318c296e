use std::path::{Path, PathBuf};

use kluster_wire::messages::TaskRecord;
use tracing::{debug, info};
use uuid::Uuid;

use super::{MemoryDb, RecordUpdate, TaskDb};
use crate::error::DbError;

/// Memory backend mirrored to a JSON file after every change.
#[derive(Debug)]
pub struct JsonFileDb {
    path: PathBuf,
    inner: MemoryDb,
}

impl JsonFileDb {
    /// Load existing records from `path`, or start empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let records: Vec<TaskRecord> = serde_json::from_str(&data)?;
            info!(path = %path.display(), records = records.len(), "loaded task db");
            MemoryDb::from_records(records)
        } else {
            MemoryDb::new()
        };
        Ok(Self { path, inner })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), DbError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.inner.ordered())?;
        std::fs::write(&self.path, data)?;
        debug!(path = %self.path.display(), records = self.inner.len(), "saved task db");
        Ok(())
    }
}

impl TaskDb for JsonFileDb {
    fn name(&self) -> &'static str {
        "file"
    }

    fn add_record(&mut self, record: TaskRecord) -> Result<(), DbError> {
        self.inner.add_record(record)?;
        self.save()
    }

    fn update_record(&mut self, msg_id: Uuid, update: RecordUpdate) -> Result<(), DbError> {
        self.inner.update_record(msg_id, update)?;
        self.save()
    }

    fn get_record(&self, msg_id: &Uuid) -> Result<Option<TaskRecord>, DbError> {
        self.inner.get_record(msg_id)
    }

    fn drop_record(&mut self, msg_id: &Uuid) -> Result<bool, DbError> {
        let dropped = self.inner.drop_record(msg_id)?;
        if dropped {
            self.save()?;
        }
        Ok(dropped)
    }

    fn record_ids(&self) -> Result<Vec<Uuid>, DbError> {
        self.inner.record_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("tasks.json");
        let record = TaskRecord::new(Uuid::new_v4(), "apply_request", "task", Utc::now());

        let mut db = JsonFileDb::open(&path).unwrap();
        db.add_record(record.clone()).unwrap();
        db.update_record(
            record.msg_id,
            RecordUpdate {
                status: Some("ok".into()),
                result_payload: Some(vec![1, 2, 3]),
                ..Default::default()
            },
        )
        .unwrap();
        drop(db);

        let reopened = JsonFileDb::open(&path).unwrap();
        let stored = reopened.get_record(&record.msg_id).unwrap().unwrap();
        assert_eq!(stored.status.as_deref(), Some("ok"));
        assert_eq!(stored.result_payload, Some(vec![1, 2, 3]));
        assert_eq!(reopened.record_ids().unwrap(), vec![record.msg_id]);
    }

    #[test]
    fn corrupt_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(JsonFileDb::open(&path), Err(DbError::Json(_))));
    }
}
