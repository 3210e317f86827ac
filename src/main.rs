mod audit;
mod config;
mod console;
mod context;
mod dispatch;
mod events;
mod logging;
mod monitors;
mod pools;
mod queues;
mod server;
mod storage;
mod tasks;
mod wire;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use config::AppConfig;
use context::ServerContext;
use events::TASK_DEAD_LETTERED_EVENT;
use logging::{LogLevel, Logger, LoggerConfig};
use monitors::BackgroundLoop;
use pools::{run_read_loop, WorkerHandle};
use server::TcpServer;
use storage::StorageFacade;

const ACCEPT_IDLE_BACKOFF: Duration = Duration::from_millis(50);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(250);

fn main() {
    let app_config = load_config_or_exit();
    let log_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });

    let logger = Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    });

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage startup error: {error}");
        process::exit(2);
    });

    let ctx = ServerContext::new(&app_config, logger, storage);
    if let Err(error) = ctx.install_shutdown_signals() {
        ctx.logger.warn(
            Some("main::shutdown"),
            &format!("failed to register shutdown signals: {error}"),
        );
    }

    ctx.logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for workers",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "server_id": ctx.server_id,
            "storage_engine": ctx.storage.engine().as_str(),
        })),
    );

    // Dead-lettered tasks are worth a console line even when log filtering
    // would swallow the monitor output. Detached so a stalled stdout can
    // never hold up the retry path that emits the event.
    ctx.emitter.on_async(TASK_DEAD_LETTERED_EVENT, |event| {
        let task_id = event
            .payload
            .as_ref()
            .and_then(|payload| payload.get("task_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<unknown>");
        println!("task {task_id} moved to the dead-letter queue");
        Ok(())
    });

    match ctx.recover_persisted_state() {
        Ok(summary) => {
            ctx.logger.log(
                LogLevel::Info,
                Some("main::recovery"),
                "persisted state recovered",
                Some(json!({
                    "ready": summary.ready,
                    "restored_in_progress": summary.restored_in_progress,
                    "dead_letter": summary.dead_letter,
                    "next_task_id": summary.next_task_id,
                    "elapsed_ms": summary.elapsed_ms,
                })),
            );
        }
        Err(error) => {
            // Startup proceeds with empty queues; in-memory state is
            // authoritative for the rest of this run.
            ctx.logger.error(
                Some("main::recovery"),
                &format!("failed to recover persisted state: {error}"),
            );
        }
    }

    let background: Vec<BackgroundLoop> = vec![
        dispatch::spawn_dispatcher(Arc::clone(&ctx), app_config.dispatch.tick_interval_ms),
        monitors::spawn_heartbeat_monitor(Arc::clone(&ctx), app_config.heartbeat.monitor_interval_ms),
        monitors::spawn_dead_letter_monitor(
            Arc::clone(&ctx),
            app_config.deadletter.monitor_interval_ms,
            app_config.deadletter.stats_every_ticks,
        ),
        monitors::spawn_cleanup_monitor(
            Arc::clone(&ctx),
            app_config.retention.cleanup_interval_ms,
            app_config.retention.max_age_ms,
        ),
    ];

    let acceptor_ctx = Arc::clone(&ctx);
    let acceptor = thread::spawn(move || run_acceptor(acceptor_ctx, server));

    console::run_console(&ctx);

    ctx.request_shutdown();
    let _ = acceptor.join();
    for mut background_loop in background {
        background_loop.stop();
    }

    for handle in ctx.registry.drain_all() {
        handle.close_for_shutdown();
    }
    if let Err(error) = ctx.storage.flush() {
        ctx.logger
            .warn(Some("main::shutdown"), &format!("final flush failed: {error}"));
    }

    ctx.logger.info(Some("main::shutdown"), "shutdown complete");
}

// Accept loop: every connection gets a worker handle, a registry entry and
// its own read loop thread.
fn run_acceptor(ctx: Arc<ServerContext>, server: TcpServer) {
    loop {
        if ctx.is_shutting_down() {
            return;
        }

        match server.try_accept_persistent() {
            Ok(Some(connection)) => {
                let handle = WorkerHandle::new(connection);
                ctx.registry.insert(Arc::clone(&handle));

                ctx.logger.log(
                    LogLevel::Info,
                    Some("main::acceptor"),
                    "worker connected",
                    Some(json!({
                        "worker_id": handle.worker_id().to_string(),
                        "peer_addr": handle.peer_addr().to_string(),
                        "workers_total": ctx.registry.count(),
                    })),
                );
                if let Err(error) = ctx.emitter.emit(
                    events::WORKER_CONNECTED_EVENT,
                    Some(json!({ "worker_id": handle.worker_id().to_string() })),
                ) {
                    ctx.logger
                        .warn(Some("main::acceptor"), &format!("event emit failed: {error}"));
                }

                let loop_ctx = Arc::clone(&ctx);
                thread::spawn(move || run_read_loop(loop_ctx, handle));
            }
            Ok(None) => thread::sleep(ACCEPT_IDLE_BACKOFF),
            Err(error) => {
                ctx.logger
                    .warn(Some("main::acceptor"), &format!("{error}"));
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
