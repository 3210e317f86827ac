use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::tasks::{Task, TaskStatus};

use super::{StorageError, StorageStatistics, TaskStore};

const KEYSPACE_VERSION: &str = "v1";

// Embedded document-store backend. One record per task keyed on its id,
// with secondary indexes on status, creation time and last status change:
//
//   v1:t:<task_id>                     -> task record (JSON)
//   v1:s:<status>:<task_id>            -> task_id
//   v1:c:<created_millis>:<task_id>    -> task_id
//   v1:u:<updated_millis>:<task_id>    -> task_id
//
// Millisecond stamps are zero-padded so lexicographic key order is
// chronological order. Record and indexes are updated in one batch, which
// is what makes a crash leave either the old record or the new one.
pub struct SledTaskStore {
    db: sled::Db,
    // Serializes read-modify-write of record + indexes across callers.
    write_lock: Mutex<()>,
}

fn record_key(task_id: &str) -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:t:{task_id}").into_bytes()
}

fn record_prefix() -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:t:").into_bytes()
}

fn status_key(status: TaskStatus, task_id: &str) -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:s:{}:{task_id}", status.as_str()).into_bytes()
}

fn status_prefix(status: TaskStatus) -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:s:{}:", status.as_str()).into_bytes()
}

fn created_key(created_at: DateTime<Utc>, task_id: &str) -> Vec<u8> {
    format!(
        "{KEYSPACE_VERSION}:c:{:020}:{task_id}",
        created_at.timestamp_millis()
    )
    .into_bytes()
}

fn created_prefix() -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:c:").into_bytes()
}

fn updated_key(status_updated_at: DateTime<Utc>, task_id: &str) -> Vec<u8> {
    format!(
        "{KEYSPACE_VERSION}:u:{:020}:{task_id}",
        status_updated_at.timestamp_millis()
    )
    .into_bytes()
}

fn updated_prefix() -> Vec<u8> {
    format!("{KEYSPACE_VERSION}:u:").into_bytes()
}

fn remove_index_entries(batch: &mut sled::Batch, task: &Task) {
    batch.remove(status_key(task.status, &task.id));
    batch.remove(created_key(task.created_at, &task.id));
    batch.remove(updated_key(task.status_updated_at, &task.id));
}

fn insert_index_entries(batch: &mut sled::Batch, task: &Task) {
    batch.insert(status_key(task.status, &task.id), task.id.as_bytes());
    batch.insert(created_key(task.created_at, &task.id), task.id.as_bytes());
    batch.insert(
        updated_key(task.status_updated_at, &task.id),
        task.id.as_bytes(),
    );
}

impl SledTaskStore {
    pub fn open(data_path: &Path) -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .path(data_path)
            .open()
            .map_err(StorageError::Sled)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn read_record(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        let value = self
            .db
            .get(record_key(task_id))
            .map_err(StorageError::Sled)?;
        value
            .map(|raw| serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeTask))
            .transpose()
    }

    fn write_record_locked(&self, task: &Task) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(task).map_err(StorageError::SerializeTask)?;

        let mut batch = sled::Batch::default();
        if let Some(previous) = self.read_record(&task.id)? {
            remove_index_entries(&mut batch, &previous);
        }
        batch.insert(record_key(&task.id), encoded);
        insert_index_entries(&mut batch, task);

        self.db.apply_batch(batch).map_err(StorageError::Sled)
    }

    // Chronological scan over a time index; the filter sees the full record.
    fn scan_time_index(
        &self,
        prefix: Vec<u8>,
        mut keep: impl FnMut(&Task) -> bool,
    ) -> Result<Vec<Task>, StorageError> {
        let mut tasks = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (_, task_id_raw) = entry.map_err(StorageError::Sled)?;
            let task_id = String::from_utf8_lossy(task_id_raw.as_ref()).to_string();
            if let Some(task) = self.read_record(&task_id)? {
                if keep(&task) {
                    tasks.push(task);
                }
            }
        }
        Ok(tasks)
    }

    fn count_status(&self, status: TaskStatus) -> Result<u64, StorageError> {
        let mut count = 0_u64;
        for entry in self.db.scan_prefix(status_prefix(status)) {
            entry.map_err(StorageError::Sled)?;
            count += 1;
        }
        Ok(count)
    }
}

impl TaskStore for SledTaskStore {
    fn save_raw(&self, task: &Task) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        self.write_record_locked(task)
    }

    fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        let Some(mut task) = self.read_record(task_id)? else {
            return Ok(());
        };
        task.set_status(status);
        self.write_record_locked(&task)
    }

    fn get(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        self.read_record(task_id)
    }

    fn delete(&self, task_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        let Some(task) = self.read_record(task_id)? else {
            return Ok(false);
        };

        let mut batch = sled::Batch::default();
        batch.remove(record_key(task_id));
        remove_index_entries(&mut batch, &task);
        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        Ok(true)
    }

    fn load_pending(&self) -> Result<Vec<Task>, StorageError> {
        // The creation index is already in CreatedAt order.
        self.scan_time_index(created_prefix(), |task| {
            matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress)
        })
    }

    fn load_dead_letter(&self) -> Result<Vec<Task>, StorageError> {
        // The status-change index is already in StatusUpdatedAt order.
        self.scan_time_index(updated_prefix(), |task| {
            task.status == TaskStatus::DeadLetter
        })
    }

    fn statistics(&self) -> Result<StorageStatistics, StorageError> {
        let pending = self.count_status(TaskStatus::Pending)?;
        let in_progress = self.count_status(TaskStatus::InProgress)?;
        let completed = self.count_status(TaskStatus::Completed)?;
        let failed = self.count_status(TaskStatus::Failed)?;
        let dead_letter = self.count_status(TaskStatus::DeadLetter)?;

        Ok(StorageStatistics {
            pending,
            in_progress,
            completed,
            failed,
            dead_letter,
            total: pending + in_progress + completed + failed + dead_letter,
            generated_at: Utc::now(),
        })
    }

    fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");

        // Ascending status-change order lets the scan stop at the cutoff.
        let cutoff_boundary = updated_key(cutoff, "");
        let mut expired = Vec::new();
        for entry in self.db.scan_prefix(updated_prefix()) {
            let (key, task_id_raw) = entry.map_err(StorageError::Sled)?;
            if key.as_ref() >= cutoff_boundary.as_slice() {
                break;
            }
            let task_id = String::from_utf8_lossy(task_id_raw.as_ref()).to_string();
            if let Some(task) = self.read_record(&task_id)? {
                if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                    expired.push(task);
                }
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let mut batch = sled::Batch::default();
        for task in &expired {
            batch.remove(record_key(&task.id));
            remove_index_entries(&mut batch, task);
        }
        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        Ok(expired.len() as u64)
    }

    fn all_task_ids(&self) -> Result<Vec<String>, StorageError> {
        let prefix = record_prefix();
        let mut ids = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            let key_text = String::from_utf8_lossy(key.as_ref()).to_string();
            ids.push(key_text[prefix.len()..].to_owned());
        }
        Ok(ids)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }
}
