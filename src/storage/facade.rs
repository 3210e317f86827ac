use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::tasks::{Task, TaskStatus};

use super::{
    expand_home_path, JsonFileTaskStore, SledTaskStore, StorageEngine, StorageError,
    StorageStatistics, TaskStore,
};

pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backend: Box<dyn TaskStore>,
}

impl std::fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFacade")
            .field("engine", &self.engine)
            .field("data_path", &self.data_path)
            .finish()
    }
}

impl StorageFacade {
    // Idempotent: opening an already-initialized data directory is the
    // restart-recovery path.
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let started = Instant::now();
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };
        let data_path = expand_home_path(&app_config.storage.path)?;

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let backend: Box<dyn TaskStore> = match engine {
            StorageEngine::Sled => Box::new(SledTaskStore::open(&data_path)?),
            StorageEngine::JsonFiles => Box::new(JsonFileTaskStore::open(&data_path)?),
        };

        let facade = Self {
            engine,
            data_path,
            backend,
        };

        let stats = facade.statistics()?;
        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Task store initialized",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": facade.data_path.display().to_string(),
                "persisted_total": stats.total,
                "pending": stats.pending + stats.in_progress,
                "dead_letter": stats.dead_letter,
                "startup_ms": started.elapsed().as_millis() as u64,
            })),
        );

        Ok(facade)
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &PathBuf {
        &self.data_path
    }

    pub fn save(&self, task: &Task, status: TaskStatus) -> Result<(), StorageError> {
        self.backend.save(task, status)
    }

    pub fn save_raw(&self, task: &Task) -> Result<(), StorageError> {
        self.backend.save_raw(task)
    }

    pub fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StorageError> {
        self.backend.update_status(task_id, status)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        self.backend.get(task_id)
    }

    pub fn delete(&self, task_id: &str) -> Result<bool, StorageError> {
        self.backend.delete(task_id)
    }

    pub fn load_pending(&self) -> Result<Vec<Task>, StorageError> {
        self.backend.load_pending()
    }

    pub fn load_dead_letter(&self) -> Result<Vec<Task>, StorageError> {
        self.backend.load_dead_letter()
    }

    pub fn statistics(&self) -> Result<StorageStatistics, StorageError> {
        self.backend.statistics()
    }

    pub fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        self.backend.cleanup_old(cutoff)
    }

    pub fn all_task_ids(&self) -> Result<Vec<String>, StorageError> {
        self.backend.all_task_ids()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}
