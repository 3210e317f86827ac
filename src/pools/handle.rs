use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::context::ServerContext;
use crate::dispatch::apply_retry_policy;
use crate::events::{WORKER_REGISTERED_EVENT, WORKER_REMOVED_EVENT};
use crate::logging::LogLevel;
use crate::server::PersistentConnection;
use crate::tasks::{Task, TaskKind, TaskStatus};
use crate::wire::codec::{self, CodecError, InboundMessage, READ_BUFFER_SIZE};
use crate::wire::messages::{
    PingResponseMessage, RegisterMessage, RegisterResponseMessage, TaskMessage, TaskResult,
};

const READ_IDLE_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Busy => f.write_str("Busy"),
        }
    }
}

#[derive(Debug)]
pub enum SendTaskError {
    NotIdle { task: Box<Task> },
    DispatchFailed { task_id: String },
}

impl fmt::Display for SendTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotIdle { task } => {
                write!(f, "worker is not idle, task {} was not dispatched", task.id)
            }
            Self::DispatchFailed { task_id } => {
                write!(f, "dispatch of task {task_id} failed, worker was disposed")
            }
        }
    }
}

impl std::error::Error for SendTaskError {}

struct WorkerState {
    status: WorkerStatus,
    last_heartbeat_at: DateTime<Utc>,
    in_flight: Option<Task>,
    client_id: Option<String>,
    name: Option<String>,
    // None until the worker registers; legacy workers never do and are
    // treated as capable of every kind.
    capabilities: Option<HashSet<TaskKind>>,
    disposed: bool,
    cleanup_started: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFlightTaskInfo {
    pub task_id: String,
    pub kind: TaskKind,
    pub retry_count: u32,
}

#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    pub worker_id: Uuid,
    pub name: Option<String>,
    pub client_id: Option<String>,
    pub status: WorkerStatus,
    pub registered: bool,
    pub capabilities: Option<Vec<TaskKind>>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub in_flight_task: Option<InFlightTaskInfo>,
}

// Per-connection actor. Owns the socket; its mutable fields are touched
// only by its own read loop, by the dispatcher through send_task, and by
// the heartbeat monitor through dispose.
pub struct WorkerHandle {
    worker_id: Uuid,
    connection: PersistentConnection,
    connected_at: DateTime<Utc>,
    state: Mutex<WorkerState>,
}

impl WorkerHandle {
    pub fn new(connection: PersistentConnection) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            worker_id: Uuid::new_v4(),
            connection,
            connected_at: now,
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Idle,
                last_heartbeat_at: now,
                in_flight: None,
                client_id: None,
                name: None,
                capabilities: None,
                disposed: false,
                cleanup_started: false,
            }),
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.connection.peer_addr()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().expect("worker handle state lock poisoned")
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.status == WorkerStatus::Idle && !state.disposed
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    pub fn is_registered(&self) -> bool {
        self.state().capabilities.is_some()
    }

    pub fn is_alive(&self, timeout_ms: u64) -> bool {
        let last = self.state().last_heartbeat_at;
        Utc::now() - last <= chrono::Duration::milliseconds(timeout_ms as i64)
    }

    pub fn can_handle(&self, kind: TaskKind) -> bool {
        match &self.state().capabilities {
            Some(capabilities) => capabilities.contains(&kind),
            None => true,
        }
    }

    pub fn record_heartbeat(&self) {
        self.state().last_heartbeat_at = Utc::now();
    }

    // Diagnostic view for the operator console and the monitors.
    pub fn current_task_info(&self) -> WorkerSnapshot {
        let state = self.state();
        let mut capabilities = state.capabilities.as_ref().map(|set| {
            set.iter().copied().collect::<Vec<_>>()
        });
        if let Some(capabilities) = capabilities.as_mut() {
            capabilities.sort_by_key(|kind| kind.as_str());
        }

        WorkerSnapshot {
            worker_id: self.worker_id,
            name: state.name.clone(),
            client_id: state.client_id.clone(),
            status: state.status,
            registered: state.capabilities.is_some(),
            capabilities,
            connected_at: self.connected_at,
            last_heartbeat_at: state.last_heartbeat_at,
            in_flight_task: state.in_flight.as_ref().map(|task| InFlightTaskInfo {
                task_id: task.id.clone(),
                kind: task.kind,
                retry_count: task.retry_count,
            }),
        }
    }

    // Hands a task to this worker. The Idle->Busy transition happens here,
    // before the socket write, so the dispatcher's idle probe can never
    // observe a just-assigned worker. Any write failure routes the task
    // through the retry policy and disposes the handle.
    pub fn send_task(&self, ctx: &ServerContext, mut task: Task) -> Result<(), SendTaskError> {
        {
            let mut state = self.state();
            if state.disposed || state.cleanup_started || state.status == WorkerStatus::Busy {
                return Err(SendTaskError::NotIdle {
                    task: Box::new(task),
                });
            }
            state.status = WorkerStatus::Busy;
            task.client_id = Some(self.worker_id.to_string());
            task.set_status(TaskStatus::InProgress);
            state.in_flight = Some(task.clone());
        }

        if let Err(error) = ctx.storage.save_raw(&task) {
            ctx.logger.warn(
                Some("pools::handle"),
                &format!("failed to persist task {} as InProgress: {error}", task.id),
            );
        }

        let frame = match codec::encode_message(&TaskMessage::new(&task)) {
            Ok(frame) => frame,
            Err(error) => {
                return Err(self.fail_dispatch(ctx, &task.id, &format!("task encode error: {error}")))
            }
        };

        match self.connection.try_write(&frame) {
            Ok(written) if written == frame.len() => {
                ctx.logger.log(
                    LogLevel::Debug,
                    Some("pools::handle"),
                    "task dispatched",
                    Some(json!({
                        "task_id": task.id,
                        "kind": task.kind.as_str(),
                        "worker_id": self.worker_id.to_string(),
                        "retry_count": task.retry_count,
                    })),
                );
                Ok(())
            }
            Ok(written) => Err(self.fail_dispatch(
                ctx,
                &task.id,
                &format!("partial task write: {written} of {} bytes", frame.len()),
            )),
            Err(error) => {
                Err(self.fail_dispatch(ctx, &task.id, &format!("task write error: {error}")))
            }
        }
    }

    fn fail_dispatch(&self, ctx: &ServerContext, task_id: &str, reason: &str) -> SendTaskError {
        ctx.logger.warn(
            Some("pools::handle"),
            &format!("dispatch to worker {} failed: {reason}", self.worker_id),
        );
        self.dispose(ctx, reason);
        SendTaskError::DispatchFailed {
            task_id: task_id.to_owned(),
        }
    }

    // The single cleanup path shared by read-loop exit, heartbeat eviction
    // and dispatch write failure. Runs at most once per handle; the
    // in-flight slot is cleared only after the retry policy has moved the
    // task into a queue, so no observer sees the task in neither place.
    pub fn dispose(&self, ctx: &ServerContext, reason: &str) {
        let orphaned = {
            let mut state = self.state();
            if state.cleanup_started {
                return;
            }
            state.cleanup_started = true;
            state.disposed = true;
            state.status = WorkerStatus::Busy;
            state.in_flight.clone()
        };

        ctx.registry.remove(&self.worker_id);

        if let Some(task) = orphaned {
            apply_retry_policy(ctx, task, &self.worker_id.to_string(), reason);
            self.state().in_flight = None;
        }

        let _ = self.connection.shutdown();

        ctx.logger.log(
            LogLevel::Info,
            Some("pools::handle"),
            "worker removed",
            Some(json!({
                "worker_id": self.worker_id.to_string(),
                "reason": reason,
                "workers_remaining": ctx.registry.count(),
            })),
        );
        if let Err(error) = ctx.emitter.emit(
            WORKER_REMOVED_EVENT,
            Some(json!({
                "worker_id": self.worker_id.to_string(),
                "reason": reason,
            })),
        ) {
            ctx.logger
                .warn(Some("pools::handle"), &format!("event emit failed: {error}"));
        }
    }

    // Shutdown path: close the socket without touching the in-flight task.
    // Whatever is still InProgress in the store is restored as Pending on
    // the next startup.
    pub fn close_for_shutdown(&self) {
        {
            let mut state = self.state();
            state.cleanup_started = true;
            state.disposed = true;
            state.status = WorkerStatus::Busy;
        }
        let _ = self.connection.shutdown();
    }

    // Inbound frame dispatch, one frame per successful socket read.
    pub fn handle_frame(&self, ctx: &ServerContext, frame: &[u8]) {
        match codec::classify_frame(frame) {
            Ok(InboundMessage::Result(result)) | Ok(InboundMessage::LegacyResult(result)) => {
                self.handle_result(ctx, result);
            }
            Ok(InboundMessage::Ping(ping)) => {
                self.handle_ping(ctx, ping.client_id);
            }
            Ok(InboundMessage::Register(register)) => {
                self.handle_register(ctx, register);
            }
            Ok(InboundMessage::LegacyTask(task)) => {
                ctx.logger.debug(
                    Some("pools::handle"),
                    &format!(
                        "dropping task-shaped frame {} from worker {}",
                        task.task_id, self.worker_id
                    ),
                );
            }
            Err(error) => {
                // Protocol errors never cost the worker its connection.
                self.log_frame_error(ctx, &error);
            }
        }
    }

    fn log_frame_error(&self, ctx: &ServerContext, error: &CodecError) {
        ctx.logger.warn(
            Some("pools::handle"),
            &format!(
                "dropping undecodable frame from worker {}: {error}",
                self.worker_id
            ),
        );
    }

    fn handle_result(&self, ctx: &ServerContext, result: TaskResult) {
        let matched_task = {
            let mut state = self.state();
            let matches = state
                .in_flight
                .as_ref()
                .is_some_and(|task| task.id == result.task_id);
            if matches {
                let task = state.in_flight.take();
                if !state.disposed {
                    state.status = WorkerStatus::Idle;
                }
                task
            } else {
                None
            }
        };

        match matched_task {
            Some(mut task) => {
                let status = if result.success {
                    task.error_message = None;
                    TaskStatus::Completed
                } else {
                    task.error_message = Some(
                        result
                            .result_data
                            .clone()
                            .unwrap_or_else(|| "task execution failed".to_owned()),
                    );
                    TaskStatus::Failed
                };
                task.set_status(status);

                if let Err(error) = ctx.storage.save_raw(&task) {
                    ctx.logger.warn(
                        Some("pools::handle"),
                        &format!("failed to persist result for task {}: {error}", task.id),
                    );
                }

                ctx.logger.log(
                    LogLevel::Info,
                    Some("pools::handle"),
                    "task result recorded",
                    Some(json!({
                        "task_id": task.id,
                        "status": status.as_str(),
                        "worker_id": self.worker_id.to_string(),
                        "result_data": result.result_data,
                    })),
                );
            }
            None => self.record_detached_result(ctx, result),
        }
    }

    // A result that does not match the in-flight slot: the worker was slow
    // and its task has already been requeued, or the frame names a task we
    // never dispatched to this worker. A known task still reaches its
    // terminal status; the stale queued copy is dropped at dispatch time.
    fn record_detached_result(&self, ctx: &ServerContext, result: TaskResult) {
        match ctx.storage.get(&result.task_id) {
            Ok(Some(mut task)) => {
                let status = if result.success {
                    task.error_message = None;
                    TaskStatus::Completed
                } else {
                    task.error_message = Some(
                        result
                            .result_data
                            .clone()
                            .unwrap_or_else(|| "task execution failed".to_owned()),
                    );
                    TaskStatus::Failed
                };
                task.set_status(status);
                if let Err(error) = ctx.storage.save_raw(&task) {
                    ctx.logger.warn(
                        Some("pools::handle"),
                        &format!(
                            "failed to persist detached result for task {}: {error}",
                            task.id
                        ),
                    );
                    return;
                }
                ctx.logger.log(
                    LogLevel::Warn,
                    Some("pools::handle"),
                    "late result accepted for already-requeued task",
                    Some(json!({
                        "task_id": task.id,
                        "status": status.as_str(),
                        "worker_id": self.worker_id.to_string(),
                    })),
                );
            }
            Ok(None) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!(
                        "dropping result for unknown task {} from worker {}",
                        result.task_id, self.worker_id
                    ),
                );
            }
            Err(error) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!(
                        "failed to look up task {} for detached result: {error}",
                        result.task_id
                    ),
                );
            }
        }
    }

    fn handle_ping(&self, ctx: &ServerContext, client_id: Option<String>) {
        self.record_heartbeat();
        if let Some(client_id) = client_id {
            self.state().client_id.get_or_insert(client_id);
        }

        match codec::encode_message(&PingResponseMessage::new(&ctx.server_id)) {
            Ok(frame) => {
                self.write_reply(ctx, &frame, "ping response");
            }
            Err(error) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!("failed to encode ping response: {error}"),
                );
            }
        }
    }

    fn handle_register(&self, ctx: &ServerContext, register: RegisterMessage) {
        let accepted: HashSet<TaskKind> = register
            .capabilities
            .iter()
            .filter_map(|raw| TaskKind::parse(raw))
            .collect();
        let mut accepted_names: Vec<String> = accepted
            .iter()
            .map(|kind| kind.as_str().to_owned())
            .collect();
        accepted_names.sort();

        {
            let mut state = self.state();
            state.client_id = register.client_id.clone();
            state.name = register.client_name.clone();
            state.capabilities = Some(accepted);
            state.last_heartbeat_at = Utc::now();
        }

        let response = RegisterResponseMessage::accepted(
            &ctx.server_id,
            accepted_names.clone(),
            "registration accepted",
        );
        match codec::encode_message(&response) {
            Ok(frame) => {
                self.write_reply(ctx, &frame, "register response");
            }
            Err(error) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!("failed to encode register response: {error}"),
                );
            }
        }

        ctx.logger.log(
            LogLevel::Info,
            Some("pools::handle"),
            "worker registered",
            Some(json!({
                "worker_id": self.worker_id.to_string(),
                "client_id": register.client_id,
                "client_name": register.client_name,
                "version": register.version,
                "accepted_capabilities": accepted_names,
            })),
        );
        if let Err(error) = ctx.emitter.emit(
            WORKER_REGISTERED_EVENT,
            Some(json!({
                "worker_id": self.worker_id.to_string(),
                "accepted_capabilities": accepted_names,
            })),
        ) {
            ctx.logger
                .warn(Some("pools::handle"), &format!("event emit failed: {error}"));
        }
    }

    fn write_reply(&self, ctx: &ServerContext, frame: &[u8], label: &str) -> bool {
        match self.connection.try_write(frame) {
            Ok(written) if written == frame.len() => true,
            Ok(written) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!(
                        "partial {label} write to worker {}: wrote {written} of {} bytes",
                        self.worker_id,
                        frame.len()
                    ),
                );
                false
            }
            Err(error) => {
                ctx.logger.warn(
                    Some("pools::handle"),
                    &format!("failed to write {label} to worker {}: {error}", self.worker_id),
                );
                false
            }
        }
    }
}

// Per-connection read loop. Every exit reason converges on dispose(), which
// retries or dead-letters the in-flight task and drops the registry entry.
pub fn run_read_loop(ctx: Arc<ServerContext>, handle: Arc<WorkerHandle>) {
    let mut buffer = vec![0_u8; READ_BUFFER_SIZE];

    let reason = loop {
        if ctx.is_shutting_down() {
            break "server shutdown".to_owned();
        }
        if handle.is_disposed() {
            break "handle disposed".to_owned();
        }

        match handle.connection.try_read(&mut buffer) {
            Ok(0) => break "connection closed by worker".to_owned(),
            Ok(size) => handle.handle_frame(&ctx, &buffer[..size]),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(READ_IDLE_BACKOFF);
            }
            Err(error) => break format!("socket read error: {error}"),
        }
    };

    // Shutdown is not a worker failure: the in-flight task must stay
    // persisted as InProgress so the next startup restores it as Pending.
    if ctx.is_shutting_down() {
        handle.close_for_shutdown();
        return;
    }

    handle.dispose(&ctx, &reason);
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::{json, Value};

    use crate::context::test_support::test_context;
    use crate::server::test_support::connected_pair;
    use crate::tasks::{Task, TaskKind, TaskStatus};

    use super::{run_read_loop, SendTaskError, WorkerHandle, WorkerStatus};

    fn read_client_frame(client: &mut std::net::TcpStream) -> Value {
        let mut buffer = [0_u8; 4096];
        let size = client.read(&mut buffer).expect("client read should pass");
        assert!(size > 0, "client read returned EOF");
        serde_json::from_slice(&buffer[..size]).expect("client frame should parse")
    }

    #[test]
    fn fresh_handle_is_idle_legacy_and_alive() {
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);

        assert!(handle.is_idle());
        assert!(!handle.is_registered());
        assert!(handle.is_alive(30_000));
        assert!(handle.can_handle(TaskKind::CheckPrime));
        assert!(handle.can_handle(TaskKind::HashText));

        let info = handle.current_task_info();
        assert_eq!(info.status, WorkerStatus::Idle);
        assert!(info.capabilities.is_none());
        assert!(info.in_flight_task.is_none());
    }

    #[test]
    fn registration_restricts_capabilities_and_replies() {
        let (ctx, data_path) = test_context();
        let (conn, mut client) = connected_pair();
        let handle = WorkerHandle::new(conn);

        let frame = serde_json::to_vec(&json!({
            "Type": "Register",
            "Timestamp": Utc::now(),
            "ClientId": "client-7",
            "ClientName": "alpha",
            "Capabilities": ["CheckPrime", "SortList"],
            "Version": "1.0"
        }))
        .expect("register frame should encode");
        handle.handle_frame(&ctx, &frame);

        assert!(handle.is_registered());
        assert!(handle.can_handle(TaskKind::CheckPrime));
        assert!(!handle.can_handle(TaskKind::HashText));

        let reply = read_client_frame(&mut client);
        assert_eq!(reply["Type"], "RegisterResponse");
        assert_eq!(reply["Success"], true);
        assert_eq!(reply["AcceptedCapabilities"], json!(["CheckPrime"]));
        assert_eq!(reply["ServerId"], ctx.server_id);

        let info = handle.current_task_info();
        assert_eq!(info.name.as_deref(), Some("alpha"));
        assert_eq!(info.client_id.as_deref(), Some("client-7"));

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn ping_refreshes_heartbeat_and_gets_a_pong() {
        let (ctx, data_path) = test_context();
        let (conn, mut client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        let before = handle.current_task_info().last_heartbeat_at;

        thread::sleep(Duration::from_millis(5));
        let frame = serde_json::to_vec(&json!({
            "Type": "PingRequest",
            "Timestamp": Utc::now(),
            "ClientId": "client-7"
        }))
        .expect("ping frame should encode");
        handle.handle_frame(&ctx, &frame);

        assert!(handle.current_task_info().last_heartbeat_at > before);

        let reply = read_client_frame(&mut client);
        assert_eq!(reply["Type"], "PingResponse");
        assert_eq!(reply["ServerId"], ctx.server_id);

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn send_task_marks_busy_persists_in_progress_and_writes_frame() {
        let (ctx, data_path) = test_context();
        let (conn, mut client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        let task = Task::new("Task-0", TaskKind::CheckPrime, "7");
        ctx.storage
            .save(&task, TaskStatus::Pending)
            .expect("seed save should pass");

        handle
            .send_task(&ctx, task)
            .expect("send_task should pass");

        assert!(!handle.is_idle());
        let info = handle.current_task_info();
        assert_eq!(
            info.in_flight_task.expect("slot should be filled").task_id,
            "Task-0"
        );

        let persisted = ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .expect("record should exist");
        assert_eq!(persisted.status, TaskStatus::InProgress);
        assert_eq!(
            persisted.client_id.as_deref(),
            Some(handle.worker_id().to_string().as_str())
        );

        let frame = read_client_frame(&mut client);
        assert_eq!(frame["Type"], "Task");
        assert_eq!(frame["Task"]["TaskId"], "Task-0");
        assert_eq!(frame["Task"]["Type"], "CheckPrime");
        assert_eq!(frame["Task"]["Data"], "7");

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn send_task_to_busy_worker_is_rejected_without_side_effects() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "7"))
            .expect("first send should pass");

        let error = handle
            .send_task(&ctx, Task::new("Task-1", TaskKind::CheckPrime, "9"))
            .expect_err("second send should fail");
        let SendTaskError::NotIdle { task } = error else {
            panic!("expected NotIdle, got {error:?}");
        };
        assert_eq!(task.id, "Task-1");

        // The busy worker still holds its original assignment.
        assert_eq!(
            handle
                .current_task_info()
                .in_flight_task
                .expect("slot should be filled")
                .task_id,
            "Task-0"
        );

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn matching_result_completes_task_and_frees_worker() {
        let (ctx, data_path) = test_context();
        let (conn, mut client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "7"))
            .expect("send should pass");
        let _ = read_client_frame(&mut client);

        let frame = serde_json::to_vec(&json!({
            "Type": "Result",
            "Timestamp": Utc::now(),
            "Result": { "TaskId": "Task-0", "Success": true, "ResultData": "True" }
        }))
        .expect("result frame should encode");
        handle.handle_frame(&ctx, &frame);

        assert!(handle.is_idle());
        assert!(handle.current_task_info().in_flight_task.is_none());

        let persisted = ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .expect("record should exist");
        assert_eq!(persisted.status, TaskStatus::Completed);
        assert!(persisted.error_message.is_none());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn negative_result_is_terminal_failed_not_retried() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "banana"))
            .expect("send should pass");

        let frame = serde_json::to_vec(&json!({
            "Type": "Result",
            "Timestamp": Utc::now(),
            "Result": { "TaskId": "Task-0", "Success": false, "ResultData": "not a number" }
        }))
        .expect("result frame should encode");
        handle.handle_frame(&ctx, &frame);

        let persisted = ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .expect("record should exist");
        assert_eq!(persisted.status, TaskStatus::Failed);
        assert_eq!(persisted.error_message.as_deref(), Some("not a number"));
        // Failure reported by the worker is terminal: nothing was requeued.
        assert!(ctx.ready_queue.is_empty());
        assert!(ctx.dead_letter_queue.is_empty());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn legacy_bare_result_is_handled_like_a_typed_one() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "7"))
            .expect("send should pass");

        let frame = serde_json::to_vec(&json!({
            "TaskId": "Task-0",
            "Success": true,
            "ResultData": "True"
        }))
        .expect("legacy frame should encode");
        handle.handle_frame(&ctx, &frame);

        assert!(handle.is_idle());
        assert_eq!(
            ctx.storage
                .get("Task-0")
                .expect("get should pass")
                .expect("record should exist")
                .status,
            TaskStatus::Completed
        );

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn late_result_for_requeued_task_still_reaches_terminal_state() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        // The task was requeued after this worker was presumed dead; the
        // in-flight slot no longer mentions it.
        let mut task = Task::new("Task-0", TaskKind::CheckPrime, "7");
        task.record_retry_attempt();
        ctx.storage
            .save(&task, TaskStatus::Pending)
            .expect("seed save should pass");
        ctx.ready_queue.enqueue(task);

        let frame = serde_json::to_vec(&json!({
            "Type": "Result",
            "Timestamp": Utc::now(),
            "Result": { "TaskId": "Task-0", "Success": true, "ResultData": "True" }
        }))
        .expect("result frame should encode");
        handle.handle_frame(&ctx, &frame);

        assert_eq!(
            ctx.storage
                .get("Task-0")
                .expect("get should pass")
                .expect("record should exist")
                .status,
            TaskStatus::Completed
        );
        // The stale queue entry survives here; the dispatcher drops it when
        // it sees the terminal status.
        assert_eq!(ctx.ready_queue.len(), 1);

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn undecodable_frame_is_dropped_and_connection_survives() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle.handle_frame(&ctx, b"{ not json at all");
        handle.handle_frame(&ctx, br#"{"Type":"Mystery"}"#);

        assert!(!handle.is_disposed());
        assert!(handle.is_idle());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn dispose_requeues_in_flight_task_and_removes_handle() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "7"))
            .expect("send should pass");

        handle.dispose(&ctx, "worker process killed");

        assert_eq!(ctx.registry.count(), 0);
        assert!(handle.is_disposed());
        assert!(handle.current_task_info().in_flight_task.is_none());

        let requeued = ctx
            .ready_queue
            .try_dequeue()
            .expect("task should be requeued");
        assert_eq!(requeued.id, "Task-0");
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.client_id.is_none());

        // Cleanup runs at most once even if another activity races dispose.
        handle.dispose(&ctx, "heartbeat timeout");
        assert!(ctx.ready_queue.is_empty());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn read_loop_exit_runs_the_cleanup_path() {
        let (ctx, data_path) = test_context();
        let (conn, client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        let loop_ctx = Arc::clone(&ctx);
        let loop_handle = Arc::clone(&handle);
        let reader = thread::spawn(move || run_read_loop(loop_ctx, loop_handle));

        // Closing the client socket is the implicit cancellation channel.
        drop(client);
        reader.join().expect("read loop should exit");

        assert!(handle.is_disposed());
        assert_eq!(ctx.registry.count(), 0);

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn read_loop_processes_frames_sent_by_the_client() {
        let (ctx, data_path) = test_context();
        let (conn, mut client) = connected_pair();
        let handle = WorkerHandle::new(conn);
        ctx.registry.insert(Arc::clone(&handle));

        let loop_ctx = Arc::clone(&ctx);
        let loop_handle = Arc::clone(&handle);
        let reader = thread::spawn(move || run_read_loop(loop_ctx, loop_handle));

        let frame = serde_json::to_vec(&json!({
            "Type": "Register",
            "Timestamp": Utc::now(),
            "Capabilities": ["HashText"]
        }))
        .expect("register frame should encode");
        client.write_all(&frame).expect("client write should pass");

        for _ in 0..100 {
            if handle.is_registered() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_registered());
        assert!(handle.can_handle(TaskKind::HashText));
        assert!(!handle.can_handle(TaskKind::CheckPrime));

        drop(client);
        reader.join().expect("read loop should exit");

        let _ = std::fs::remove_dir_all(data_path);
    }
}
