//! Bulk submission: hands back a handle immediately and admits entities from
//! a background task, pausing with exponential backoff while the queue is
//! saturated.

use super::backoff::{Pause, SaturationBackoff};
use super::queue::TaskQueue;
use super::task::{Priority, ProcessingTask, SubmitError, TaskHandle, TaskOutcome, TaskState};
use crate::pipeline::outcome::PipelineResult;
use crate::stages::contract::{EntityRef, EntityType};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Backoff applied while the queue reports saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkRetry {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

enum Admission {
    Waiting,
    Admitted(TaskHandle),
    Rejected(String),
}

struct BulkEntry {
    entity: EntityRef,
    admission: Admission,
}

/// Live counters for a bulk request. Every entity is in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkProgress {
    pub total: usize,
    /// Not yet admitted, including entities waiting out a saturation backoff.
    pub awaiting_admission: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
    pub cancelled: usize,
}

impl BulkProgress {
    pub fn resolved(&self) -> usize {
        self.succeeded + self.failed + self.rejected + self.cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.resolved() == self.total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkItemOutcome {
    Succeeded(Arc<PipelineResult>),
    Failed(Arc<PipelineResult>),
    Rejected(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub entity: EntityRef,
    pub outcome: BulkItemOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkSummary {
    pub progress: BulkProgress,
    /// One item per requested entity, in request order.
    pub items: Vec<BulkItem>,
}

pub struct BulkCoordinator {
    queue: Arc<TaskQueue>,
    retry: BulkRetry,
    shutdown: CancellationToken,
}

impl BulkCoordinator {
    pub fn new(queue: Arc<TaskQueue>, retry: BulkRetry, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            retry,
            shutdown,
        }
    }

    pub fn submit_many(
        &self,
        entity_ids: impl IntoIterator<Item = u64>,
        entity_type: EntityType,
        priority: Priority,
    ) -> BulkHandle {
        let tasks = entity_ids
            .into_iter()
            .map(|id| ProcessingTask::new(EntityRef::new(id, entity_type)).with_priority(priority))
            .collect();
        self.submit_tasks(tasks)
    }

    pub fn submit_tasks(&self, tasks: Vec<ProcessingTask>) -> BulkHandle {
        let entries = Arc::new(Mutex::new(
            tasks
                .iter()
                .map(|task| BulkEntry {
                    entity: task.entity,
                    admission: Admission::Waiting,
                })
                .collect::<Vec<_>>(),
        ));

        tracing::info!(entities = tasks.len(), "bulk submission started");
        let submission = tokio::spawn(admit_all(
            self.queue.clone(),
            self.retry,
            self.shutdown.clone(),
            tasks,
            entries.clone(),
        ));

        BulkHandle {
            entries,
            submission,
        }
    }
}

async fn admit_all(
    queue: Arc<TaskQueue>,
    retry: BulkRetry,
    shutdown: CancellationToken,
    tasks: Vec<ProcessingTask>,
    entries: Arc<Mutex<Vec<BulkEntry>>>,
) {
    for (index, task) in tasks.into_iter().enumerate() {
        let admission = admit(&queue, task, retry, &shutdown).await;
        entries.lock().expect("bulk entries mutex poisoned")[index].admission = admission;
    }
    tracing::debug!("bulk submission finished admitting entities");
}

/// Pushes one task, pausing while the queue is saturated. Any other
/// rejection is final.
async fn admit(
    queue: &TaskQueue,
    task: ProcessingTask,
    retry: BulkRetry,
    shutdown: &CancellationToken,
) -> Admission {
    let entity = task.entity;
    let mut backoff = SaturationBackoff::new(retry, shutdown);
    loop {
        if shutdown.is_cancelled() {
            return Admission::Rejected(SubmitError::ShuttingDown.to_string());
        }
        let err = match queue.push(task.clone()) {
            Ok(handle) => return Admission::Admitted(handle),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Admission::Rejected(err.to_string()),
        };

        tracing::debug!(
            entity = %entity,
            attempt = backoff.attempts() + 1,
            delay_ms = backoff.delay().as_millis() as u64,
            error = %err,
            "bulk submission deferred"
        );
        match backoff.pause().await {
            Pause::Retry => {}
            Pause::Exhausted => {
                tracing::warn!(
                    entity = %entity,
                    attempts = backoff.attempts(),
                    "queue stayed saturated; bulk submission gave up"
                );
                return Admission::Rejected(err.to_string());
            }
            Pause::Cancelled => return Admission::Rejected(SubmitError::ShuttingDown.to_string()),
        }
    }
}

pub struct BulkHandle {
    entries: Arc<Mutex<Vec<BulkEntry>>>,
    submission: JoinHandle<()>,
}

impl BulkHandle {
    pub fn progress(&self) -> BulkProgress {
        let entries = self.entries.lock().expect("bulk entries mutex poisoned");
        let mut progress = BulkProgress {
            total: entries.len(),
            ..BulkProgress::default()
        };
        for entry in entries.iter() {
            match &entry.admission {
                Admission::Waiting => progress.awaiting_admission += 1,
                Admission::Rejected(_) => progress.rejected += 1,
                Admission::Admitted(handle) => match handle.state() {
                    TaskState::Queued => progress.queued += 1,
                    TaskState::Running => progress.in_flight += 1,
                    TaskState::Finished(result) if result.overall_succeeded => {
                        progress.succeeded += 1
                    }
                    TaskState::Finished(_) => progress.failed += 1,
                    TaskState::Cancelled => progress.cancelled += 1,
                },
            }
        }
        progress
    }

    /// Waits for admission to finish and every admitted task to resolve.
    pub async fn wait(self) -> BulkSummary {
        if let Err(err) = self.submission.await {
            tracing::error!(error = %err, "bulk submission task failed");
        }

        let admissions: Vec<(EntityRef, Result<TaskHandle, String>)> = {
            let entries = self.entries.lock().expect("bulk entries mutex poisoned");
            entries
                .iter()
                .map(|entry| {
                    let admission = match &entry.admission {
                        Admission::Admitted(handle) => Ok(handle.clone()),
                        Admission::Rejected(reason) => Err(reason.clone()),
                        Admission::Waiting => Err("bulk submission aborted".to_string()),
                    };
                    (entry.entity, admission)
                })
                .collect()
        };

        let mut items = Vec::with_capacity(admissions.len());
        for (entity, admission) in admissions {
            let outcome = match admission {
                Ok(handle) => match handle.wait().await {
                    TaskOutcome::Completed(result) if result.overall_succeeded => {
                        BulkItemOutcome::Succeeded(result)
                    }
                    TaskOutcome::Completed(result) => BulkItemOutcome::Failed(result),
                    TaskOutcome::Cancelled => BulkItemOutcome::Cancelled,
                },
                Err(reason) => BulkItemOutcome::Rejected(reason),
            };
            items.push(BulkItem { entity, outcome });
        }

        let mut progress = BulkProgress {
            total: items.len(),
            ..BulkProgress::default()
        };
        for item in &items {
            match item.outcome {
                BulkItemOutcome::Succeeded(_) => progress.succeeded += 1,
                BulkItemOutcome::Failed(_) => progress.failed += 1,
                BulkItemOutcome::Rejected(_) => progress.rejected += 1,
                BulkItemOutcome::Cancelled => progress.cancelled += 1,
            }
        }
        tracing::info!(
            total = progress.total,
            succeeded = progress.succeeded,
            failed = progress.failed,
            rejected = progress.rejected,
            cancelled = progress.cancelled,
            "bulk submission resolved"
        );

        BulkSummary { progress, items }
    }
}
