use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::{Task, TaskKind};

pub const TASK_MESSAGE_TYPE: &str = "Task";
pub const RESULT_MESSAGE_TYPE: &str = "Result";
pub const PING_REQUEST_MESSAGE_TYPE: &str = "PingRequest";
pub const PING_RESPONSE_MESSAGE_TYPE: &str = "PingResponse";
pub const REGISTER_MESSAGE_TYPE: &str = "Register";
pub const REGISTER_RESPONSE_MESSAGE_TYPE: &str = "RegisterResponse";

// Body of a server->worker task hand-off. Status bookkeeping stays
// server-side; the worker only sees what it needs to execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    #[serde(rename = "TaskId")]
    pub task_id: String,
    #[serde(rename = "Type")]
    pub kind: TaskKind,
    #[serde(rename = "Data")]
    pub data: String,
    #[serde(rename = "RetryCount", default)]
    pub retry_count: u32,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "LastRetryAt", default)]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind,
            data: task.payload.clone(),
            retry_count: task.retry_count,
            created_at: task.created_at,
            last_retry_at: task.last_retry_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "TaskId")]
    pub task_id: String,
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "ResultData", default)]
    pub result_data: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Task")]
    pub task: TaskAssignment,
}

impl TaskMessage {
    pub fn new(task: &Task) -> Self {
        Self {
            message_type: TASK_MESSAGE_TYPE.to_owned(),
            timestamp: Utc::now(),
            task: TaskAssignment::from(task),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Result")]
    pub result: TaskResult,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequestMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ClientId", default)]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingResponseMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ServerId")]
    pub server_id: String,
}

impl PingResponseMessage {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            message_type: PING_RESPONSE_MESSAGE_TYPE.to_owned(),
            timestamp: Utc::now(),
            server_id: server_id.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ClientId", default)]
    pub client_id: Option<String>,
    #[serde(rename = "ClientName", default)]
    pub client_name: Option<String>,
    #[serde(rename = "Capabilities", default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponseMessage {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "ServerId")]
    pub server_id: String,
    #[serde(rename = "AcceptedCapabilities")]
    pub accepted_capabilities: Vec<String>,
}

impl RegisterResponseMessage {
    pub fn accepted(
        server_id: impl Into<String>,
        accepted_capabilities: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_type: REGISTER_RESPONSE_MESSAGE_TYPE.to_owned(),
            timestamp: Utc::now(),
            success: true,
            message: Some(message.into()),
            server_id: server_id.into(),
            accepted_capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tasks::{Task, TaskKind};

    use super::{
        PingResponseMessage, RegisterMessage, RegisterResponseMessage, ResultMessage, TaskMessage,
        PING_RESPONSE_MESSAGE_TYPE, REGISTER_RESPONSE_MESSAGE_TYPE, TASK_MESSAGE_TYPE,
    };

    #[test]
    fn task_message_wraps_assignment_under_task_key() {
        let mut task = Task::new("Task-12", TaskKind::CheckPrime, "97");
        task.record_retry_attempt();

        let message = TaskMessage::new(&task);
        let value = serde_json::to_value(&message).expect("message should serialize");

        assert_eq!(value["Type"], TASK_MESSAGE_TYPE);
        assert!(value.get("Timestamp").is_some());
        assert_eq!(value["Task"]["TaskId"], "Task-12");
        assert_eq!(value["Task"]["Type"], "CheckPrime");
        assert_eq!(value["Task"]["Data"], "97");
        assert_eq!(value["Task"]["RetryCount"], 1);
        assert!(value["Task"].get("LastRetryAt").is_some());
        assert!(value["Task"].get("Status").is_none());
    }

    #[test]
    fn result_message_parses_nested_result_body() {
        let raw = r#"{
            "Type": "Result",
            "Timestamp": "2024-05-01T10:00:00Z",
            "Result": { "TaskId": "Task-3", "Success": true, "ResultData": "True" }
        }"#;

        let message: ResultMessage = serde_json::from_str(raw).expect("result should parse");
        assert_eq!(message.result.task_id, "Task-3");
        assert!(message.result.success);
        assert_eq!(message.result.result_data.as_deref(), Some("True"));
    }

    #[test]
    fn register_message_tolerates_missing_optional_fields() {
        let raw = r#"{ "Type": "Register", "Timestamp": "2024-05-01T10:00:00Z" }"#;

        let message: RegisterMessage = serde_json::from_str(raw).expect("register should parse");
        assert!(message.client_id.is_none());
        assert!(message.client_name.is_none());
        assert!(message.capabilities.is_empty());
        assert!(message.version.is_none());
    }

    #[test]
    fn ping_response_carries_server_id() {
        let message = PingResponseMessage::new("server-1");
        let value = serde_json::to_value(&message).expect("message should serialize");

        assert_eq!(value["Type"], PING_RESPONSE_MESSAGE_TYPE);
        assert_eq!(value["ServerId"], "server-1");
    }

    #[test]
    fn register_response_lists_accepted_capabilities() {
        let message = RegisterResponseMessage::accepted(
            "server-1",
            vec!["CheckPrime".to_owned()],
            "registered",
        );
        let value = serde_json::to_value(&message).expect("message should serialize");

        assert_eq!(value["Type"], REGISTER_RESPONSE_MESSAGE_TYPE);
        assert!(value["Success"].as_bool().expect("Success should be bool"));
        assert_eq!(value["AcceptedCapabilities"][0], "CheckPrime");
        assert_eq!(value["ServerId"], "server-1");
    }
}
