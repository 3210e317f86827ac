use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};

use crate::tasks::Task;

#[derive(Debug)]
pub enum AuditError {
    Append {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append { path, source } => write!(
                f,
                "failed to append to dead-letter audit log '{}': {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for AuditError {}

// Append-only, line-based, human-readable record of every task that
// crossed into DeadLetter. Operators grep this file; it is never parsed
// back by the server.
pub struct DeadLetterAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DeadLetterAuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, task: &Task, handle_id: &str, reason: &str) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock().expect("audit log lock poisoned");

        let last_retry = task
            .last_retry_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| "never".to_owned());

        let line = format!(
            "{} task={} kind={} data={:?} retries={} created_at={} last_retry_at={} worker={} reason={:?}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            task.id,
            task.kind,
            task.payload,
            task.retry_count,
            task.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            last_retry,
            handle_id,
            reason,
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| AuditError::Append {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| AuditError::Append {
                path: self.path.clone(),
                source,
            })
    }
}
