use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::context::ServerContext;
use crate::logging::LogLevel;
use crate::tasks::TaskKind;

const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

// Interval loop on its own thread with a stop flag, joined on drop. All
// background activities (dispatcher included) run through this.
pub struct BackgroundLoop {
    name: &'static str,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);

        let worker = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                tick();
                interruptible_sleep(&stop, interval);
            }
        });

        Self {
            name,
            stop_signal,
            worker: Some(worker),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// Sliced sleep so a stop request never waits out a long interval (the
// cleanup loop sleeps for an hour at a time).
fn interruptible_sleep(stop: &AtomicBool, interval: Duration) {
    let mut remaining = interval;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let slice = remaining.min(STOP_POLL_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
}

// Evicts workers whose last heartbeat aged past the timeout. Disposal runs
// the same cleanup path as a read-loop exit, retrying or dead-lettering the
// in-flight task.
pub fn heartbeat_tick(ctx: &ServerContext) -> usize {
    let mut evicted = 0;
    for handle in ctx.registry.snapshot() {
        if !handle.is_alive(ctx.heartbeat_timeout_ms) {
            ctx.logger.log(
                LogLevel::Warn,
                Some("monitors::heartbeat"),
                "evicting silent worker",
                Some(json!({
                    "worker_id": handle.worker_id().to_string(),
                    "timeout_ms": ctx.heartbeat_timeout_ms,
                })),
            );
            handle.dispose(ctx, "heartbeat timeout");
            evicted += 1;
        }
    }
    evicted
}

pub fn spawn_heartbeat_monitor(ctx: Arc<ServerContext>, interval_ms: u64) -> BackgroundLoop {
    BackgroundLoop::spawn(
        "heartbeat-monitor",
        Duration::from_millis(interval_ms),
        move || {
            heartbeat_tick(&ctx);
        },
    )
}

#[derive(Debug, Default)]
pub struct DeadLetterMonitorState {
    last_depth: usize,
    ticks_since_stats: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DeadLetterObservation {
    pub depth: usize,
    pub depth_changed: bool,
    pub emitted_stats: bool,
}

// Reports dead-letter depth deltas, and every few ticks a wider aggregate:
// worker idle/busy split, queue depths, and which kinds are covered by the
// currently-connected workers.
pub fn dead_letter_tick(
    ctx: &ServerContext,
    state: &mut DeadLetterMonitorState,
    stats_every_ticks: u32,
) -> DeadLetterObservation {
    let depth = ctx.dead_letter_queue.len();
    let depth_changed = depth != state.last_depth;
    if depth_changed {
        ctx.logger.log(
            LogLevel::Info,
            Some("monitors::deadletter"),
            "dead-letter queue depth changed",
            Some(json!({
                "previous": state.last_depth,
                "current": depth,
            })),
        );
        state.last_depth = depth;
    }

    state.ticks_since_stats += 1;
    let emitted_stats = stats_every_ticks > 0 && state.ticks_since_stats >= stats_every_ticks;
    if emitted_stats {
        state.ticks_since_stats = 0;

        let workers = ctx.registry.snapshot();
        let idle = workers.iter().filter(|worker| worker.is_idle()).count();
        let coverage: Vec<serde_json::Value> = TaskKind::all()
            .iter()
            .map(|kind| {
                let claiming = workers
                    .iter()
                    .filter(|worker| worker.can_handle(*kind))
                    .count();
                json!({ "kind": kind.as_str(), "workers": claiming })
            })
            .collect();

        ctx.logger.log(
            LogLevel::Info,
            Some("monitors::deadletter"),
            "queue and worker statistics",
            Some(json!({
                "workers_total": workers.len(),
                "workers_idle": idle,
                "workers_busy": workers.len() - idle,
                "ready_depth": ctx.ready_queue.len(),
                "dead_letter_depth": depth,
                "capability_coverage": coverage,
            })),
        );
    }

    DeadLetterObservation {
        depth,
        depth_changed,
        emitted_stats,
    }
}

pub fn spawn_dead_letter_monitor(
    ctx: Arc<ServerContext>,
    interval_ms: u64,
    stats_every_ticks: u32,
) -> BackgroundLoop {
    let mut state = DeadLetterMonitorState::default();
    BackgroundLoop::spawn(
        "deadletter-monitor",
        Duration::from_millis(interval_ms),
        move || {
            dead_letter_tick(&ctx, &mut state, stats_every_ticks);
        },
    )
}

// Retention pass: drop terminal records older than the window, then log a
// statistics line for the operator.
pub fn cleanup_tick(ctx: &ServerContext, max_age_ms: u64) -> u64 {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age_ms as i64);

    let removed = match ctx.storage.cleanup_old(cutoff) {
        Ok(removed) => removed,
        Err(error) => {
            ctx.logger.warn(
                Some("monitors::cleanup"),
                &format!("retention cleanup failed: {error}"),
            );
            return 0;
        }
    };

    match ctx.storage.statistics() {
        Ok(stats) => {
            ctx.logger.log(
                LogLevel::Info,
                Some("monitors::cleanup"),
                "retention cleanup finished",
                Some(json!({
                    "removed": removed,
                    "pending": stats.pending,
                    "in_progress": stats.in_progress,
                    "completed": stats.completed,
                    "failed": stats.failed,
                    "dead_letter": stats.dead_letter,
                    "total": stats.total,
                })),
            );
        }
        Err(error) => {
            ctx.logger.warn(
                Some("monitors::cleanup"),
                &format!("statistics after cleanup failed: {error}"),
            );
        }
    }

    removed
}

pub fn spawn_cleanup_monitor(
    ctx: Arc<ServerContext>,
    interval_ms: u64,
    max_age_ms: u64,
) -> BackgroundLoop {
    BackgroundLoop::spawn(
        "cleanup-monitor",
        Duration::from_millis(interval_ms),
        move || {
            cleanup_tick(&ctx, max_age_ms);
        },
    )
}
