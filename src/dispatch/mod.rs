use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::context::ServerContext;
use crate::events::TASK_DEAD_LETTERED_EVENT;
use crate::logging::LogLevel;
use crate::monitors::BackgroundLoop;
use crate::pools::SendTaskError;
use crate::tasks::{Task, TaskStatus};

// Applied whenever a worker dies, vanishes, or its socket write fails while
// it holds a task: bump the retry budget, then either requeue or quarantine.
// Negative results reported by a live worker never come through here.
pub fn apply_retry_policy(ctx: &ServerContext, mut task: Task, handle_id: &str, reason: &str) {
    task.record_retry_attempt();
    task.client_id = None;

    if task.retry_count < ctx.max_retries {
        task.set_status(TaskStatus::Pending);
        if let Err(error) = ctx.storage.save_raw(&task) {
            ctx.logger.warn(
                Some("dispatch::retry"),
                &format!("failed to persist requeued task {}: {error}", task.id),
            );
        }
        ctx.logger.log(
            LogLevel::Info,
            Some("dispatch::retry"),
            "task returned to ready queue",
            Some(json!({
                "task_id": task.id,
                "retry_count": task.retry_count,
                "max_retries": ctx.max_retries,
                "worker_id": handle_id,
                "reason": reason,
            })),
        );
        ctx.ready_queue.enqueue(task);
    } else {
        task.set_status(TaskStatus::DeadLetter);
        task.error_message = Some(reason.to_owned());
        if let Err(error) = ctx.storage.save_raw(&task) {
            ctx.logger.warn(
                Some("dispatch::retry"),
                &format!("failed to persist dead-lettered task {}: {error}", task.id),
            );
        }
        if let Err(error) = ctx.audit.append(&task, handle_id, reason) {
            ctx.logger
                .error(Some("dispatch::retry"), &format!("{error}"));
        }
        ctx.logger.log(
            LogLevel::Warn,
            Some("dispatch::retry"),
            "task moved to dead-letter queue",
            Some(json!({
                "task_id": task.id,
                "retry_count": task.retry_count,
                "worker_id": handle_id,
                "reason": reason,
            })),
        );
        if let Err(error) = ctx.emitter.emit(
            TASK_DEAD_LETTERED_EVENT,
            Some(json!({ "task_id": task.id, "reason": reason })),
        ) {
            ctx.logger
                .warn(Some("dispatch::retry"), &format!("event emit failed: {error}"));
        }
        ctx.dead_letter_queue.enqueue(task);
    }
}

// Head-of-line task whose kind no connected worker claims. Quarantined
// without touching the retry budget; retries are for worker crashes.
fn dead_letter_unroutable(ctx: &ServerContext, mut task: Task) {
    let reason = format!("no connected worker claims kind {}", task.kind);
    task.set_status(TaskStatus::DeadLetter);
    task.error_message = Some(reason.clone());

    if let Err(error) = ctx.storage.save_raw(&task) {
        ctx.logger.warn(
            Some("dispatch"),
            &format!("failed to persist unroutable task {}: {error}", task.id),
        );
    }
    if let Err(error) = ctx.audit.append(&task, "dispatcher", &reason) {
        ctx.logger.error(Some("dispatch"), &format!("{error}"));
    }
    ctx.logger.log(
        LogLevel::Warn,
        Some("dispatch"),
        "unroutable task moved to dead-letter queue",
        Some(json!({ "task_id": task.id, "kind": task.kind.as_str() })),
    );
    if let Err(error) = ctx.emitter.emit(
        TASK_DEAD_LETTERED_EVENT,
        Some(json!({ "task_id": task.id, "reason": reason })),
    ) {
        ctx.logger
            .warn(Some("dispatch"), &format!("event emit failed: {error}"));
    }
    ctx.dead_letter_queue.enqueue(task);
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    QueueEmpty,
    HeadMoved,
    DroppedTerminal { task_id: String },
    Dispatched { task_id: String, worker_id: Uuid },
    DispatchFailed { task_id: String },
    RequeuedNotIdle { task_id: String },
    DeadLetteredUnroutable { task_id: String },
    NoIdleWorker,
    NoWorkersConnected,
}

// One dispatcher iteration: pair the queue head with a capable idle worker,
// or drain it to the dead-letter queue when no connected worker claims its
// kind. With nobody connected the head just waits.
pub fn dispatcher_tick(ctx: &ServerContext) -> DispatchOutcome {
    let Some(head) = ctx.ready_queue.peek_front() else {
        return DispatchOutcome::QueueEmpty;
    };

    // A late result can terminalize a task that is still queued; such a
    // copy must not be dispatched again.
    match ctx.storage.get(&head.id) {
        Ok(Some(record)) if record.status.is_terminal() => {
            return if ctx.ready_queue.try_dequeue_expected(&head.id).is_some() {
                ctx.logger.log(
                    LogLevel::Info,
                    Some("dispatch"),
                    "dropping queued copy of already-terminal task",
                    Some(json!({
                        "task_id": head.id,
                        "status": record.status.as_str(),
                    })),
                );
                DispatchOutcome::DroppedTerminal { task_id: head.id }
            } else {
                DispatchOutcome::HeadMoved
            };
        }
        Ok(_) => {}
        Err(error) => {
            // Persistence trouble never stalls dispatch.
            ctx.logger.warn(
                Some("dispatch"),
                &format!("terminal-status check for task {} failed: {error}", head.id),
            );
        }
    }

    let workers = ctx.registry.snapshot();
    if workers.is_empty() {
        return DispatchOutcome::NoWorkersConnected;
    }

    if let Some(worker) = workers
        .iter()
        .find(|worker| worker.is_idle() && worker.can_handle(head.kind))
    {
        let Some(task) = ctx.ready_queue.try_dequeue_expected(&head.id) else {
            return DispatchOutcome::HeadMoved;
        };
        let task_id = task.id.clone();

        match worker.send_task(ctx, task) {
            Ok(()) => DispatchOutcome::Dispatched {
                task_id,
                worker_id: worker.worker_id(),
            },
            Err(SendTaskError::NotIdle { task }) => {
                // Lost an assignment race with a disposal; put it back.
                ctx.ready_queue.enqueue(*task);
                DispatchOutcome::RequeuedNotIdle { task_id }
            }
            // send_task already routed the task through the retry policy.
            Err(SendTaskError::DispatchFailed { task_id }) => {
                DispatchOutcome::DispatchFailed { task_id }
            }
        }
    } else if !workers.iter().any(|worker| worker.can_handle(head.kind)) {
        let Some(task) = ctx.ready_queue.try_dequeue_expected(&head.id) else {
            return DispatchOutcome::HeadMoved;
        };
        let task_id = task.id.clone();
        dead_letter_unroutable(ctx, task);
        DispatchOutcome::DeadLetteredUnroutable { task_id }
    } else {
        DispatchOutcome::NoIdleWorker
    }
}

pub fn spawn_dispatcher(ctx: Arc<ServerContext>, tick_interval_ms: u64) -> BackgroundLoop {
    BackgroundLoop::spawn(
        "dispatcher",
        Duration::from_millis(tick_interval_ms),
        move || {
            dispatcher_tick(&ctx);
        },
    )
}
