use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TASK_ID_PREFIX: &str = "Task-";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TaskKind {
    CheckPrime,
    HashText,
}

impl TaskKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CheckPrime" => Some(Self::CheckPrime),
            "HashText" => Some(Self::HashText),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckPrime => "CheckPrime",
            Self::HashText => "HashText",
        }
    }

    pub fn all() -> &'static [TaskKind] {
        &[Self::CheckPrime, Self::HashText]
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Pending" => Some(Self::Pending),
            "InProgress" => Some(Self::InProgress),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "DeadLetter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::DeadLetter => "DeadLetter",
        }
    }

    // Terminal for the dispatch path. DeadLetter leaves only via the
    // operator's requeue command.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }

    pub fn all() -> &'static [TaskStatus] {
        &[
            Self::Pending,
            Self::InProgress,
            Self::Completed,
            Self::Failed,
            Self::DeadLetter,
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "TaskId")]
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: TaskKind,
    #[serde(rename = "Data")]
    pub payload: String,
    #[serde(rename = "RetryCount", default)]
    pub retry_count: u32,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "LastRetryAt", default)]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(rename = "Status")]
    pub status: TaskStatus,
    #[serde(rename = "StatusUpdatedAt")]
    pub status_updated_at: DateTime<Utc>,
    #[serde(rename = "ClientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(
        rename = "ErrorMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
            retry_count: 0,
            created_at: now,
            last_retry_at: None,
            status: TaskStatus::Pending,
            status_updated_at: now,
            client_id: None,
            error_message: None,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.status_updated_at = Utc::now();
    }

    pub fn record_retry_attempt(&mut self) {
        self.retry_count += 1;
        self.last_retry_at = Some(Utc::now());
    }

    // Operator requeue from the dead-letter queue starts the retry budget over.
    pub fn reset_for_requeue(&mut self) {
        self.retry_count = 0;
        self.last_retry_at = None;
        self.client_id = None;
        self.error_message = None;
        self.set_status(TaskStatus::Pending);
    }
}

// Mints `Task-<n>` ids. Recovery observes every persisted id so the counter
// restarts strictly above anything already on disk.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{TASK_ID_PREFIX}{n}")
    }

    pub fn observe_existing(&self, task_id: &str) {
        let Some(n) = task_id
            .strip_prefix(TASK_ID_PREFIX)
            .and_then(|suffix| suffix.parse::<u64>().ok())
        else {
            return;
        };

        let _ = self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (n >= current).then_some(n + 1)
            });
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}
