use crate::scheduler::queue::TaskQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Monotonic counters shared by the scheduler and the pipeline runner.
#[derive(Default, Debug)]
pub struct Telemetry {
    submitted: AtomicU64,
    duplicates_rejected: AtomicU64,
    saturations: AtomicU64,
    cancelled: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    stages_executed: AtomicU64,
    stages_skipped: AtomicU64,
    stage_failures: AtomicU64,
    stage_timeouts: AtomicU64,
    status_write_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saturation(&self) {
        self.saturations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_run(&self, succeeded: bool) {
        if succeeded {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stage_executed(&self, succeeded: bool) {
        self.stages_executed.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.stage_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stage_skipped(&self) {
        self.stages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_timeout(&self) {
        self.stage_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_write_failure(&self) {
        self.status_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            saturations: self.saturations.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            stages_executed: self.stages_executed.load(Ordering::Relaxed),
            stages_skipped: self.stages_skipped.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            stage_timeouts: self.stage_timeouts.load(Ordering::Relaxed),
            status_write_failures: self.status_write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub submitted: u64,
    pub duplicates_rejected: u64,
    pub saturations: u64,
    pub cancelled: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub stages_executed: u64,
    pub stages_skipped: u64,
    pub stage_failures: u64,
    pub stage_timeouts: u64,
    pub status_write_failures: u64,
}

impl TelemetrySnapshot {
    pub fn runs_finished(&self) -> u64 {
        self.runs_completed + self.runs_failed
    }
}

/// Spawns a background task that periodically logs run throughput, queue depth and failures.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queue: Arc<TaskQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "entityflow::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let finished_delta = current_snapshot
                        .runs_finished()
                        .saturating_sub(last_snapshot.runs_finished());
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        finished_delta as f64 / elapsed
                    };
                    let queue_status = queue.status();

                    tracing::info!(
                        target: "entityflow::metrics",
                        throughput = format!("{throughput:.2}"),
                        pending = queue_status.pending.total(),
                        running = queue_status.running,
                        runs_completed = current_snapshot.runs_completed,
                        runs_failed = current_snapshot.runs_failed,
                        stage_failures = current_snapshot.stage_failures,
                        stage_timeouts = current_snapshot.stage_timeouts,
                        saturations = current_snapshot.saturations,
                        status_write_failures = current_snapshot.status_write_failures,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
