use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::tasks::{Task, TaskStatus};

use super::{StorageError, StorageStatistics, TaskStore};

pub const PENDING_FILE: &str = "tasks_pending.json";
pub const COMPLETED_FILE: &str = "tasks_completed.json";
pub const DEAD_LETTER_FILE: &str = "tasks_deadletter.json";
pub const STATISTICS_FILE: &str = "statistics.json";

// Plain-file backend: three JSON arrays bucketed by status family, rewritten
// whole on every mutation. The temp-file + rename dance is the crash-safety
// story: readers see the old array or the new one, never a torn file.
pub struct JsonFileTaskStore {
    data_path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Bucket {
    Pending,
    Completed,
    DeadLetter,
}

impl Bucket {
    fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending | TaskStatus::InProgress => Self::Pending,
            TaskStatus::Completed | TaskStatus::Failed => Self::Completed,
            TaskStatus::DeadLetter => Self::DeadLetter,
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Pending => PENDING_FILE,
            Self::Completed => COMPLETED_FILE,
            Self::DeadLetter => DEAD_LETTER_FILE,
        }
    }

    fn all() -> [Bucket; 3] {
        [Self::Pending, Self::Completed, Self::DeadLetter]
    }
}

impl JsonFileTaskStore {
    pub fn open(data_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            data_path: data_path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn bucket_path(&self, bucket: Bucket) -> PathBuf {
        self.data_path.join(bucket.file_name())
    }

    // Missing and corrupt files both read as an empty bucket.
    fn read_bucket(&self, bucket: Bucket) -> Result<Vec<Task>, StorageError> {
        let path = self.bucket_path(bucket);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::ReadFile { path, source }),
        };

        Ok(serde_json::from_slice(&raw).unwrap_or_default())
    }

    fn write_bucket(&self, bucket: Bucket, tasks: &[Task]) -> Result<(), StorageError> {
        let path = self.bucket_path(bucket);
        self.write_json_file(&path, &serde_json::to_vec_pretty(tasks).map_err(StorageError::SerializeTask)?)
    }

    fn write_json_file(&self, path: &Path, content: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(|source| StorageError::WriteFile {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, path).map_err(|source| StorageError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }

    // Removes the id from every bucket, then appends the record to its own.
    fn upsert_locked(&self, task: &Task) -> Result<(), StorageError> {
        let target = Bucket::for_status(task.status);

        for bucket in Bucket::all() {
            let mut tasks = self.read_bucket(bucket)?;
            let before = tasks.len();
            tasks.retain(|existing| existing.id != task.id);
            let mut changed = tasks.len() != before;

            if bucket == target {
                tasks.push(task.clone());
                changed = true;
            }

            if changed {
                self.write_bucket(bucket, &tasks)?;
            }
        }

        Ok(())
    }

    fn find_locked(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        for bucket in Bucket::all() {
            if let Some(task) = self
                .read_bucket(bucket)?
                .into_iter()
                .find(|task| task.id == task_id)
            {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }
}

impl TaskStore for JsonFileTaskStore {
    fn save_raw(&self, task: &Task) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        self.upsert_locked(task)
    }

    fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        let Some(mut task) = self.find_locked(task_id)? else {
            return Ok(());
        };
        task.set_status(status);
        self.upsert_locked(&task)
    }

    fn get(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        self.find_locked(task_id)
    }

    fn delete(&self, task_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");

        let mut removed = false;
        for bucket in Bucket::all() {
            let mut tasks = self.read_bucket(bucket)?;
            let before = tasks.len();
            tasks.retain(|task| task.id != task_id);
            if tasks.len() != before {
                self.write_bucket(bucket, &tasks)?;
                removed = true;
            }
        }
        Ok(removed)
    }

    fn load_pending(&self) -> Result<Vec<Task>, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        let mut tasks = self.read_bucket(Bucket::Pending)?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    fn load_dead_letter(&self) -> Result<Vec<Task>, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");
        let mut tasks = self.read_bucket(Bucket::DeadLetter)?;
        tasks.sort_by(|a, b| {
            a.status_updated_at
                .cmp(&b.status_updated_at)
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    fn statistics(&self) -> Result<StorageStatistics, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");

        let mut stats = StorageStatistics {
            pending: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            dead_letter: 0,
            total: 0,
            generated_at: Utc::now(),
        };

        for bucket in Bucket::all() {
            for task in self.read_bucket(bucket)? {
                match task.status {
                    TaskStatus::Pending => stats.pending += 1,
                    TaskStatus::InProgress => stats.in_progress += 1,
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Failed => stats.failed += 1,
                    TaskStatus::DeadLetter => stats.dead_letter += 1,
                }
                stats.total += 1;
            }
        }

        let stats_path = self.data_path.join(STATISTICS_FILE);
        self.write_json_file(
            &stats_path,
            &serde_json::to_vec_pretty(&stats).map_err(StorageError::SerializeTask)?,
        )?;

        Ok(stats)
    }

    fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");

        let mut tasks = self.read_bucket(Bucket::Completed)?;
        let before = tasks.len();
        tasks.retain(|task| task.status_updated_at >= cutoff);
        let removed = (before - tasks.len()) as u64;
        if removed > 0 {
            self.write_bucket(Bucket::Completed, &tasks)?;
        }
        Ok(removed)
    }

    fn all_task_ids(&self) -> Result<Vec<String>, StorageError> {
        let _guard = self.write_lock.lock().expect("storage write lock poisoned");

        let mut ids = Vec::new();
        for bucket in Bucket::all() {
            ids.extend(self.read_bucket(bucket)?.into_iter().map(|task| task.id));
        }
        Ok(ids)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
