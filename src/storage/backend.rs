use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::{Task, TaskStatus};

use super::StorageError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageStatistics {
    #[serde(rename = "Pending")]
    pub pending: u64,
    #[serde(rename = "InProgress")]
    pub in_progress: u64,
    #[serde(rename = "Completed")]
    pub completed: u64,
    #[serde(rename = "Failed")]
    pub failed: u64,
    #[serde(rename = "DeadLetter")]
    pub dead_letter: u64,
    #[serde(rename = "Total")]
    pub total: u64,
    #[serde(rename = "GeneratedAt")]
    pub generated_at: DateTime<Utc>,
}

// Durable record of every task. Backends serialize their own operations;
// callers never coordinate access. Crash safety contract: an interrupted
// write leaves either the previous record or the new one, never a torn one.
pub trait TaskStore: Send + Sync {
    // Upserts by task id, stamping the given status and a fresh
    // status_updated_at on the stored record.
    fn save(&self, task: &Task, status: TaskStatus) -> Result<(), StorageError> {
        let mut record = task.clone();
        record.set_status(status);
        self.save_raw(&record)
    }

    // Upserts the record exactly as given, timestamps included.
    fn save_raw(&self, task: &Task) -> Result<(), StorageError>;

    fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StorageError>;

    fn get(&self, task_id: &str) -> Result<Option<Task>, StorageError>;

    // Returns whether a record was actually removed.
    fn delete(&self, task_id: &str) -> Result<bool, StorageError>;

    // Pending plus InProgress, ordered by CreatedAt ascending. InProgress
    // records are re-dispatched as Pending after a restart.
    fn load_pending(&self) -> Result<Vec<Task>, StorageError>;

    // DeadLetter records ordered by StatusUpdatedAt ascending.
    fn load_dead_letter(&self) -> Result<Vec<Task>, StorageError>;

    fn statistics(&self) -> Result<StorageStatistics, StorageError>;

    // Deletes Completed/Failed records whose terminal transition is older
    // than the cutoff; returns how many were removed.
    fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    // Every persisted task id regardless of status; feeds id-counter recovery.
    fn all_task_ids(&self) -> Result<Vec<String>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}
