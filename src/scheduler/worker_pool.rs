//! Fixed-size pool of workers pulling from the shared [`TaskQueue`].
//!
//! Every pipeline run is panic-isolated: a panic resolves that task with an
//! aborted result and the worker moves on to the next claim.

use super::queue::{ClaimedTask, TaskQueue};
use crate::pipeline::outcome::{PipelineError, PipelineResult};
use crate::pipeline::runner::{panic_message, PipelineRunner};
use crate::runtime::telemetry::Telemetry;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkerPoolParams {
    pub worker_count: usize,
    pub queue: Arc<TaskQueue>,
    pub runner: Arc<PipelineRunner>,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
}

pub(crate) struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn launch(params: WorkerPoolParams) -> Self {
        let worker_count = params.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                queue: params.queue.clone(),
                runner: params.runner.clone(),
                telemetry: params.telemetry.clone(),
                shutdown: params.shutdown.clone(),
            };

            let handle = tokio::spawn(async move {
                if let Err(panic_payload) = AssertUnwindSafe(worker.run()).catch_unwind().await {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(
                        worker = worker_id,
                        panic = %panic_msg,
                        "worker task panicked"
                    );
                }
            });
            workers.push(handle);
        }

        tracing::info!(workers = worker_count, "worker pool started");
        Self { workers }
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    pub(crate) async fn join(&mut self) {
        for (idx, handle) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            if let Err(err) = handle.await {
                tracing::warn!(worker = idx, error = %err, "worker task terminated unexpectedly");
            }
        }
        tracing::debug!("worker pool joined");
    }
}

struct Worker {
    id: usize,
    queue: Arc<TaskQueue>,
    runner: Arc<PipelineRunner>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Worker {
    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id))]
    async fn run(self) {
        tracing::debug!(worker = self.id, "worker started");
        while let Some(claimed) = self.queue.next(&self.shutdown).await {
            let result = self.process(&claimed).await;
            self.queue.complete(claimed, result);
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    async fn process(&self, claimed: &ClaimedTask) -> PipelineResult {
        let task = claimed.task();
        let started_at = SystemTime::now();
        tracing::debug!(
            worker = self.id,
            task = %claimed.id(),
            entity = %task.entity,
            "task claimed"
        );

        match AssertUnwindSafe(self.runner.run(task)).catch_unwind().await {
            Ok(result) => result,
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    worker = self.id,
                    entity = %task.entity,
                    panic = %panic_msg,
                    "pipeline run panicked"
                );
                self.telemetry.record_run(false);
                PipelineResult::aborted(
                    task.entity,
                    started_at,
                    PipelineError::Aborted(format!("pipeline panicked: {panic_msg}")),
                )
            }
        }
    }
}
