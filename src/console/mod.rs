use std::fmt;
use std::io::BufRead;

use chrono::Utc;

use crate::context::ServerContext;
use crate::tasks::{Task, TaskKind, TaskStatus};

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Create { kind: TaskKind, data: String },
    CreateBatch { kind: TaskKind, items: Vec<String> },
    Status,
    Stats,
    Clients,
    Queue,
    ClearDeadLetter,
    ReprocessDeadLetter,
    Exit,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleError {
    EmptyCommand,
    UnknownCommand { command: String },
    MissingArguments { usage: &'static str },
    UnknownTaskKind { raw: String },
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "empty command"),
            Self::UnknownCommand { command } => write!(
                f,
                "unknown command '{command}'; available: create, create batch, status, stats, clients, queue, clear-deadletter, reprocess-deadletter, exit"
            ),
            Self::MissingArguments { usage } => write!(f, "missing arguments, usage: {usage}"),
            Self::UnknownTaskKind { raw } => {
                write!(f, "unknown task kind '{raw}'; available: CheckPrime, HashText")
            }
        }
    }
}

impl std::error::Error for ConsoleError {}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return Err(ConsoleError::EmptyCommand);
    };

    match *first {
        "create" => parse_create(&tokens),
        "status" => Ok(ConsoleCommand::Status),
        "stats" => Ok(ConsoleCommand::Stats),
        "clients" => Ok(ConsoleCommand::Clients),
        "queue" => Ok(ConsoleCommand::Queue),
        "clear-deadletter" => Ok(ConsoleCommand::ClearDeadLetter),
        "reprocess-deadletter" => Ok(ConsoleCommand::ReprocessDeadLetter),
        "exit" => Ok(ConsoleCommand::Exit),
        other => Err(ConsoleError::UnknownCommand {
            command: other.to_owned(),
        }),
    }
}

fn parse_create(tokens: &[&str]) -> Result<ConsoleCommand, ConsoleError> {
    if tokens.get(1) == Some(&"batch") {
        let raw_kind = tokens.get(2).ok_or(ConsoleError::MissingArguments {
            usage: "create batch <kind> <arg> [<arg>...]",
        })?;
        let kind = parse_kind(raw_kind)?;
        let items: Vec<String> = tokens[3..].iter().map(|item| (*item).to_owned()).collect();
        if items.is_empty() {
            return Err(ConsoleError::MissingArguments {
                usage: "create batch <kind> <arg> [<arg>...]",
            });
        }
        return Ok(ConsoleCommand::CreateBatch { kind, items });
    }

    let raw_kind = tokens.get(1).ok_or(ConsoleError::MissingArguments {
        usage: "create <kind> <data>",
    })?;
    let kind = parse_kind(raw_kind)?;
    if tokens.len() < 3 {
        return Err(ConsoleError::MissingArguments {
            usage: "create <kind> <data>",
        });
    }
    Ok(ConsoleCommand::Create {
        kind,
        data: tokens[2..].join(" "),
    })
}

fn parse_kind(raw: &str) -> Result<TaskKind, ConsoleError> {
    TaskKind::parse(raw).ok_or_else(|| ConsoleError::UnknownTaskKind {
        raw: raw.to_owned(),
    })
}

// Executes one operator command and returns its output lines. Submissions
// are persisted before they are acknowledged or enqueued.
pub fn execute_command(ctx: &ServerContext, command: ConsoleCommand) -> Vec<String> {
    match command {
        ConsoleCommand::Create { kind, data } => {
            vec![submit_task(ctx, kind, data)]
        }
        ConsoleCommand::CreateBatch { kind, items } => {
            let mut lines: Vec<String> = items
                .into_iter()
                .map(|item| submit_task(ctx, kind, item))
                .collect();
            lines.push(format!("submitted batch of {} {kind} tasks", lines.len()));
            lines
        }
        ConsoleCommand::Status => status_lines(ctx),
        ConsoleCommand::Stats => stats_lines(ctx),
        ConsoleCommand::Clients => client_lines(ctx),
        ConsoleCommand::Queue => queue_lines(ctx),
        ConsoleCommand::ClearDeadLetter => clear_dead_letter(ctx),
        ConsoleCommand::ReprocessDeadLetter => reprocess_dead_letter(ctx),
        ConsoleCommand::Exit => vec!["shutting down".to_owned()],
    }
}

fn submit_task(ctx: &ServerContext, kind: TaskKind, data: String) -> String {
    let task = Task::new(ctx.task_ids.next_id(), kind, data);
    let task_id = task.id.clone();

    if let Err(error) = ctx.storage.save(&task, TaskStatus::Pending) {
        ctx.logger.warn(
            Some("console"),
            &format!("failed to persist submitted task {task_id}: {error}"),
        );
    }
    ctx.ready_queue.enqueue(task);

    format!("submitted {task_id} ({kind})")
}

fn status_lines(ctx: &ServerContext) -> Vec<String> {
    let uptime_seconds = (Utc::now() - ctx.started_at).num_seconds().max(0);
    vec![
        format!(
            "{} v{} (built {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("DISPATCHD_BUILD_DATE_UTC")
        ),
        format!("server id: {}", ctx.server_id),
        format!("uptime: {uptime_seconds}s"),
        format!(
            "storage: {} at {}",
            ctx.storage.engine().as_str(),
            ctx.storage.data_path().display()
        ),
        format!("workers connected: {}", ctx.registry.count()),
        format!(
            "queues: ready={} dead-letter={}",
            ctx.ready_queue.len(),
            ctx.dead_letter_queue.len()
        ),
    ]
}

fn stats_lines(ctx: &ServerContext) -> Vec<String> {
    match ctx.storage.statistics() {
        Ok(stats) => vec![format!(
            "persisted tasks: pending={} in_progress={} completed={} failed={} dead_letter={} total={}",
            stats.pending,
            stats.in_progress,
            stats.completed,
            stats.failed,
            stats.dead_letter,
            stats.total
        )],
        Err(error) => vec![format!("statistics unavailable: {error}")],
    }
}

fn client_lines(ctx: &ServerContext) -> Vec<String> {
    let workers = ctx.registry.snapshot();
    if workers.is_empty() {
        return vec!["no workers connected".to_owned()];
    }

    let mut lines = vec![format!("{} worker(s) connected:", workers.len())];
    for worker in workers {
        let info = worker.current_task_info();
        let capabilities = match &info.capabilities {
            Some(kinds) => kinds
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(","),
            None => "* (legacy)".to_owned(),
        };
        let in_flight = info
            .in_flight_task
            .map(|task| task.task_id)
            .unwrap_or_else(|| "-".to_owned());
        let heartbeat_age = (Utc::now() - info.last_heartbeat_at).num_seconds().max(0);

        lines.push(format!(
            "  {} name={} status={} capabilities=[{}] in_flight={} last_heartbeat={}s ago",
            info.worker_id,
            info.name.as_deref().unwrap_or("-"),
            info.status,
            capabilities,
            in_flight,
            heartbeat_age,
        ));
    }
    lines
}

fn queue_lines(ctx: &ServerContext) -> Vec<String> {
    let ready = ctx.ready_queue.snapshot_ids();
    let dead = ctx.dead_letter_queue.snapshot_ids();
    vec![
        format!("ready queue ({}): [{}]", ready.len(), ready.join(", ")),
        format!("dead-letter queue ({}): [{}]", dead.len(), dead.join(", ")),
    ]
}

fn clear_dead_letter(ctx: &ServerContext) -> Vec<String> {
    let drained = ctx.dead_letter_queue.drain_all();
    for task in &drained {
        match ctx.storage.delete(&task.id) {
            Ok(_) => {}
            Err(error) => {
                ctx.logger.warn(
                    Some("console"),
                    &format!("failed to delete cleared task {}: {error}", task.id),
                );
            }
        }
    }
    vec![format!("cleared {} dead-letter task(s)", drained.len())]
}

// Pops every dead-letter task, resets its retry budget, and re-submits it
// as Pending. Idempotent on an empty queue.
fn reprocess_dead_letter(ctx: &ServerContext) -> Vec<String> {
    let drained = ctx.dead_letter_queue.drain_all();
    let count = drained.len();
    for mut task in drained {
        task.reset_for_requeue();
        if let Err(error) = ctx.storage.save_raw(&task) {
            ctx.logger.warn(
                Some("console"),
                &format!("failed to persist requeued task {}: {error}", task.id),
            );
        }
        ctx.ready_queue.enqueue(task);
    }
    vec![format!("requeued {count} dead-letter task(s)")]
}

// Blocking line loop on stdin; returns when the operator exits or the
// process is asked to shut down.
pub fn run_console(ctx: &ServerContext) {
    println!("dispatchd console ready; type 'exit' to stop the server");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if ctx.is_shutting_down() {
            return;
        }

        let line = match line {
            Ok(line) => line,
            Err(_) => return,
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(ConsoleCommand::Exit) => {
                println!("shutting down");
                ctx.request_shutdown();
                return;
            }
            Ok(command) => {
                for output in execute_command(ctx, command) {
                    println!("{output}");
                }
            }
            Err(error) => println!("{error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::context::test_support::test_context;
    use crate::tasks::{Task, TaskKind, TaskStatus};

    use super::{execute_command, parse_command, ConsoleCommand, ConsoleError};

    #[test]
    fn parses_every_command_form() {
        assert_eq!(
            parse_command("create CheckPrime 17"),
            Ok(ConsoleCommand::Create {
                kind: TaskKind::CheckPrime,
                data: "17".to_owned(),
            })
        );
        assert_eq!(
            parse_command("create HashText hello world"),
            Ok(ConsoleCommand::Create {
                kind: TaskKind::HashText,
                data: "hello world".to_owned(),
            })
        );
        assert_eq!(
            parse_command("create batch CheckPrime 2 3 5"),
            Ok(ConsoleCommand::CreateBatch {
                kind: TaskKind::CheckPrime,
                items: vec!["2".to_owned(), "3".to_owned(), "5".to_owned()],
            })
        );
        assert_eq!(parse_command("status"), Ok(ConsoleCommand::Status));
        assert_eq!(parse_command("stats"), Ok(ConsoleCommand::Stats));
        assert_eq!(parse_command("clients"), Ok(ConsoleCommand::Clients));
        assert_eq!(parse_command("queue"), Ok(ConsoleCommand::Queue));
        assert_eq!(
            parse_command("clear-deadletter"),
            Ok(ConsoleCommand::ClearDeadLetter)
        );
        assert_eq!(
            parse_command("reprocess-deadletter"),
            Ok(ConsoleCommand::ReprocessDeadLetter)
        );
        assert_eq!(parse_command("exit"), Ok(ConsoleCommand::Exit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse_command("   "), Err(ConsoleError::EmptyCommand));
        assert!(matches!(
            parse_command("destroy"),
            Err(ConsoleError::UnknownCommand { .. })
        ));
        assert!(matches!(
            parse_command("create"),
            Err(ConsoleError::MissingArguments { .. })
        ));
        assert!(matches!(
            parse_command("create CheckPrime"),
            Err(ConsoleError::MissingArguments { .. })
        ));
        assert!(matches!(
            parse_command("create batch CheckPrime"),
            Err(ConsoleError::MissingArguments { .. })
        ));
        assert!(matches!(
            parse_command("create SortList 1"),
            Err(ConsoleError::UnknownTaskKind { .. })
        ));
    }

    #[test]
    fn create_persists_before_enqueueing() {
        let (ctx, data_path) = test_context();

        let lines = execute_command(
            &ctx,
            ConsoleCommand::Create {
                kind: TaskKind::CheckPrime,
                data: "7".to_owned(),
            },
        );
        assert_eq!(lines, vec!["submitted Task-0 (CheckPrime)"]);

        let persisted = ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .expect("record should exist");
        assert_eq!(persisted.status, TaskStatus::Pending);
        assert_eq!(ctx.ready_queue.snapshot_ids(), vec!["Task-0"]);

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn batch_create_submits_one_task_per_item() {
        let (ctx, data_path) = test_context();

        let lines = execute_command(
            &ctx,
            ConsoleCommand::CreateBatch {
                kind: TaskKind::CheckPrime,
                items: vec!["2".to_owned(), "3".to_owned(), "5".to_owned()],
            },
        );
        assert_eq!(lines.len(), 4);
        assert_eq!(
            ctx.ready_queue.snapshot_ids(),
            vec!["Task-0", "Task-1", "Task-2"]
        );
        assert_eq!(
            ctx.storage.statistics().expect("stats should pass").pending,
            3
        );

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn reprocess_moves_dead_letters_back_to_pending_with_reset_budget() {
        let (ctx, data_path) = test_context();

        let mut task = Task::new("Task-0", TaskKind::HashText, "abc");
        task.record_retry_attempt();
        task.record_retry_attempt();
        task.record_retry_attempt();
        task.error_message = Some("worker connection lost".to_owned());
        ctx.storage
            .save(&task, TaskStatus::DeadLetter)
            .expect("seed save should pass");
        ctx.dead_letter_queue.enqueue(task);

        let lines = execute_command(&ctx, ConsoleCommand::ReprocessDeadLetter);
        assert_eq!(lines, vec!["requeued 1 dead-letter task(s)"]);
        assert!(ctx.dead_letter_queue.is_empty());

        let requeued = ctx.ready_queue.try_dequeue().expect("task should requeue");
        assert_eq!(requeued.retry_count, 0);
        assert!(requeued.last_retry_at.is_none());
        assert_eq!(requeued.status, TaskStatus::Pending);

        let persisted = ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .expect("record should exist");
        assert_eq!(persisted.status, TaskStatus::Pending);
        assert_eq!(persisted.retry_count, 0);

        // Running it again on an empty queue is a no-op.
        let lines = execute_command(&ctx, ConsoleCommand::ReprocessDeadLetter);
        assert_eq!(lines, vec!["requeued 0 dead-letter task(s)"]);

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn clear_deletes_dead_letter_records() {
        let (ctx, data_path) = test_context();

        let task = Task::new("Task-0", TaskKind::HashText, "abc");
        ctx.storage
            .save(&task, TaskStatus::DeadLetter)
            .expect("seed save should pass");
        ctx.dead_letter_queue.enqueue(task);

        let lines = execute_command(&ctx, ConsoleCommand::ClearDeadLetter);
        assert_eq!(lines, vec!["cleared 1 dead-letter task(s)"]);
        assert!(ctx.dead_letter_queue.is_empty());
        assert!(ctx
            .storage
            .get("Task-0")
            .expect("get should pass")
            .is_none());

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn queue_and_status_report_current_depths() {
        let (ctx, data_path) = test_context();
        ctx.ready_queue
            .enqueue(Task::new("Task-0", TaskKind::CheckPrime, "7"));

        let queue_output = execute_command(&ctx, ConsoleCommand::Queue);
        assert_eq!(queue_output[0], "ready queue (1): [Task-0]");
        assert_eq!(queue_output[1], "dead-letter queue (0): []");

        let status_output = execute_command(&ctx, ConsoleCommand::Status);
        assert!(status_output
            .iter()
            .any(|line| line == "queues: ready=1 dead-letter=0"));
        assert!(status_output
            .iter()
            .any(|line| line == "workers connected: 0"));

        let _ = std::fs::remove_dir_all(data_path);
    }

    #[test]
    fn clients_listing_shows_capabilities_and_in_flight_task() {
        let (ctx, data_path) = test_context();
        let (conn, _client) = crate::server::test_support::connected_pair();
        let handle = crate::pools::WorkerHandle::new(conn);
        ctx.registry.insert(std::sync::Arc::clone(&handle));
        handle
            .send_task(&ctx, Task::new("Task-0", TaskKind::CheckPrime, "7"))
            .expect("send should pass");

        let lines = execute_command(&ctx, ConsoleCommand::Clients);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(&handle.worker_id().to_string()));
        assert!(lines[1].contains("status=Busy"));
        assert!(lines[1].contains("capabilities=[* (legacy)]"));
        assert!(lines[1].contains("in_flight=Task-0"));

        let _ = std::fs::remove_dir_all(data_path);
    }
}
