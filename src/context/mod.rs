use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit::DeadLetterAuditLog;
use crate::config::AppConfig;
use crate::events::EventEmitter;
use crate::logging::Logger;
use crate::pools::WorkerRegistry;
use crate::queues::TaskQueue;
use crate::storage::{StorageError, StorageFacade};
use crate::tasks::{TaskIdGenerator, TaskStatus};

// All mutable server state, threaded through every activity as one
// Arc-shared value. Nothing in the server is an ambient singleton.
pub struct ServerContext {
    pub server_id: String,
    pub started_at: DateTime<Utc>,
    pub logger: Logger,
    pub emitter: EventEmitter,
    pub storage: StorageFacade,
    pub ready_queue: TaskQueue,
    pub dead_letter_queue: TaskQueue,
    pub registry: WorkerRegistry,
    pub task_ids: TaskIdGenerator,
    pub audit: DeadLetterAuditLog,
    pub max_retries: u32,
    pub heartbeat_timeout_ms: u64,
    // Shared with the OS signal handlers; every loop polls it.
    shutdown: Arc<AtomicBool>,
}

impl ServerContext {
    pub fn new(app_config: &AppConfig, logger: Logger, storage: StorageFacade) -> Arc<Self> {
        Arc::new(Self {
            server_id: format!("dispatchd-{}", Uuid::new_v4()),
            started_at: Utc::now(),
            logger,
            emitter: EventEmitter::new(),
            storage,
            ready_queue: TaskQueue::new(),
            dead_letter_queue: TaskQueue::new(),
            registry: WorkerRegistry::new(),
            task_ids: TaskIdGenerator::new(),
            audit: DeadLetterAuditLog::new(&app_config.deadletter.audit_log_path),
            max_retries: app_config.dispatch.max_retries,
            heartbeat_timeout_ms: app_config.heartbeat.timeout_ms,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // Points SIGINT/SIGTERM straight at the shutdown flag, so a signal is
    // indistinguishable from the operator's `exit` command. The handlers
    // stay registered for the life of the process; the context outlives
    // every activity that polls the flag.
    #[cfg(unix)]
    pub fn install_shutdown_signals(&self) -> io::Result<()> {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};
        use signal_hook::flag;

        flag::register(SIGINT, Arc::clone(&self.shutdown))?;
        flag::register(SIGTERM, Arc::clone(&self.shutdown))?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_shutdown_signals(&self) -> io::Result<()> {
        Ok(())
    }

    // Restart recovery: rebuild both queues from the store and seed the
    // task-id counter above every persisted id. Tasks persisted as
    // InProgress ride along in load_pending and are restored as Pending;
    // this is the only point where persisted state is re-interpreted.
    pub fn recover_persisted_state(&self) -> Result<RecoverySummary, StorageError> {
        let started = Instant::now();
        let mut restored_in_progress = 0_usize;
        let pending = self.storage.load_pending()?;
        let ready = pending.len();
        for mut task in pending {
            if task.status != TaskStatus::Pending {
                task.set_status(TaskStatus::Pending);
                restored_in_progress += 1;
            }
            task.client_id = None;
            self.ready_queue.enqueue(task);
        }

        let dead = self.storage.load_dead_letter()?;
        let dead_letter = dead.len();
        for task in dead {
            self.dead_letter_queue.enqueue(task);
        }

        for task_id in self.storage.all_task_ids()? {
            self.task_ids.observe_existing(&task_id);
        }

        Ok(RecoverySummary {
            ready,
            restored_in_progress,
            dead_letter,
            next_task_id: self.task_ids.peek_next(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RecoverySummary {
    pub ready: usize,
    pub restored_in_progress: usize,
    pub dead_letter: usize,
    pub next_task_id: u64,
    pub elapsed_ms: u64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::config::AppConfig;
    use crate::logging::test_support::quiet_logger;
    use crate::storage::test_support::unique_temp_path;
    use crate::storage::StorageFacade;

    use super::ServerContext;

    // Context over throwaway sled storage and a temp audit log; returns the
    // data directory so tests can remove it.
    pub fn test_context() -> (Arc<ServerContext>, std::path::PathBuf) {
        test_context_with(|_config| {})
    }

    pub fn test_context_with(
        customize: impl FnOnce(&mut AppConfig),
    ) -> (Arc<ServerContext>, std::path::PathBuf) {
        let data_path = unique_temp_path("context");
        let mut app_config = AppConfig::default();
        app_config.storage.path = data_path.to_string_lossy().to_string();
        app_config.deadletter.audit_log_path = data_path
            .join("dead-letter-queue.log")
            .to_string_lossy()
            .to_string();
        customize(&mut app_config);

        let storage = StorageFacade::initialize(&app_config, &quiet_logger())
            .expect("test storage should initialize");
        let ctx = ServerContext::new(&app_config, quiet_logger(), storage);
        (ctx, data_path)
    }
}

#[cfg(test)]
mod tests {
    use crate::tasks::{Task, TaskKind, TaskStatus};

    use super::test_support::{test_context, test_context_with};

    #[test]
    fn recovery_rebuilds_queues_and_id_counter() {
        let (ctx, data_path) = test_context();

        // Simulate the previous run's leftovers.
        ctx.storage
            .save(
                &Task::new("Task-5", TaskKind::CheckPrime, "7"),
                TaskStatus::Pending,
            )
            .expect("seed save should pass");
        ctx.storage
            .save(
                &Task::new("Task-6", TaskKind::HashText, "abc"),
                TaskStatus::DeadLetter,
            )
            .expect("seed save should pass");
        ctx.storage
            .save(
                &Task::new("Task-9", TaskKind::CheckPrime, "11"),
                TaskStatus::Completed,
            )
            .expect("seed save should pass");

        // Release the sled lock before the "restarted" server opens the
        // same data directory.
        drop(ctx);

        let (restarted, _) = test_context_with(|config| {
            config.storage.path = data_path.to_string_lossy().to_string();
        });

        let summary = restarted
            .recover_persisted_state()
            .expect("recovery should pass");
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.dead_letter, 1);
        assert_eq!(summary.next_task_id, 10);

        assert_eq!(restarted.ready_queue.snapshot_ids(), vec!["Task-5"]);
        assert_eq!(restarted.dead_letter_queue.snapshot_ids(), vec!["Task-6"]);
        assert_eq!(restarted.task_ids.next_id(), "Task-10");

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn recovery_restores_in_progress_tasks_as_pending() {
        let (ctx, data_path) = test_context();

        let mut task = Task::new("Task-0", TaskKind::CheckPrime, "7");
        task.client_id = Some("worker-from-last-run".to_owned());
        ctx.storage
            .save_raw(&{
                let mut record = task.clone();
                record.set_status(TaskStatus::InProgress);
                record
            })
            .expect("seed save should pass");
        drop(ctx);

        let (restarted, _) = test_context_with(|config| {
            config.storage.path = data_path.to_string_lossy().to_string();
        });
        let summary = restarted
            .recover_persisted_state()
            .expect("recovery should pass");
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.restored_in_progress, 1);

        let recovered = restarted
            .ready_queue
            .try_dequeue()
            .expect("task should be enqueued");
        assert_eq!(recovered.status, TaskStatus::Pending);
        assert!(recovered.client_id.is_none());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn fresh_context_is_empty_and_running() {
        let (ctx, data_path) = test_context();

        assert!(ctx.server_id.starts_with("dispatchd-"));
        assert!(ctx.ready_queue.is_empty());
        assert!(ctx.dead_letter_queue.is_empty());
        assert_eq!(ctx.registry.count(), 0);
        assert!(!ctx.is_shutting_down());

        ctx.request_shutdown();
        assert!(ctx.is_shutting_down());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_raises_the_shutdown_flag() {
        let (ctx, data_path) = test_context();
        ctx.install_shutdown_signals()
            .expect("signal registration should pass");
        assert!(!ctx.is_shutting_down());

        signal_hook::low_level::raise(signal_hook::consts::signal::SIGTERM)
            .expect("raising SIGTERM should pass");

        for _ in 0..100 {
            if ctx.is_shutting_down() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(ctx.is_shutting_down());

        let _ = std::fs::remove_dir_all(data_path);
    }
}
