//! Admission-controlled priority queue with per-entity exclusivity.
//!
//! Pending and running tasks share one entity map so an entity is admitted at
//! most once until its task resolves. All state lives behind a single
//! `std::sync::Mutex` that is never held across an `.await`; workers park on a
//! [`Notify`] between claims.

use super::task::{
    Priority, ProcessingTask, SubmitError, TaskEvent, TaskHandle, TaskId, TaskState,
};
use crate::pipeline::outcome::PipelineResult;
use crate::runtime::telemetry::Telemetry;
use crate::stages::contract::EntityRef;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;

const DEFAULT_EVENT_CAPACITY: usize = 256;

struct PendingTask {
    id: TaskId,
    task: ProcessingTask,
    state_tx: watch::Sender<TaskState>,
}

impl PendingTask {
    fn key(&self) -> (Priority, std::cmp::Reverse<TaskId>) {
        (self.task.priority, std::cmp::Reverse(self.id))
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher priority first, then lower (older) id.
impl Ord for PendingTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct EntitySlot {
    handle: TaskHandle,
    running: bool,
}

struct QueueState {
    pending: BinaryHeap<PendingTask>,
    entities: HashMap<EntityRef, EntitySlot>,
    next_id: u64,
    accepting: bool,
}

/// A task handed to a worker. Dropping it without calling
/// [`TaskQueue::complete`] leaves waiters to observe a closed channel.
pub struct ClaimedTask {
    id: TaskId,
    task: ProcessingTask,
    state_tx: watch::Sender<TaskState>,
}

impl ClaimedTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task(&self) -> &ProcessingTask {
        &self.task
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }

    fn bump(&mut self, priority: Priority) {
        match priority {
            Priority::High => self.high += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightTask {
    pub id: TaskId,
    pub entity: EntityRef,
    pub priority: Priority,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub accepting: bool,
    pub capacity: usize,
    pub pending: PendingCounts,
    pub running: usize,
    /// Every admitted, unresolved task ordered by admission.
    pub in_flight: Vec<InFlightTask>,
}

pub struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<TaskEvent>,
    telemetry: Arc<Telemetry>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_parts(capacity, DEFAULT_EVENT_CAPACITY, Arc::default())
    }

    pub fn with_parts(capacity: usize, event_capacity: usize, telemetry: Arc<Telemetry>) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            capacity,
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                entities: HashMap::new(),
                next_id: 1,
                accepting: true,
            }),
            notify: Notify::new(),
            events,
            telemetry,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits a task. Rejections leave the queue untouched.
    ///
    /// Checks run in a fixed order: shutdown, then entity exclusivity, then
    /// capacity.
    pub fn push(&self, task: ProcessingTask) -> Result<TaskHandle, SubmitError> {
        let admitted = self.admit(task);
        match &admitted {
            Ok(handle) => {
                self.telemetry.record_submitted();
                tracing::debug!(
                    entity = %handle.entity(),
                    task = %handle.id(),
                    priority = %handle.priority(),
                    "task queued"
                );
                self.notify.notify_one();
            }
            Err(SubmitError::DuplicateRejected { existing }) => {
                self.telemetry.record_duplicate();
                tracing::debug!(
                    entity = %existing.entity(),
                    existing = %existing.id(),
                    "duplicate submission rejected"
                );
            }
            Err(SubmitError::QueueSaturated { capacity }) => {
                self.telemetry.record_saturation();
                tracing::warn!(capacity, "task queue saturated");
            }
            Err(SubmitError::ShuttingDown) => {}
        }
        admitted
    }

    fn admit(&self, task: ProcessingTask) -> Result<TaskHandle, SubmitError> {
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        if !state.accepting {
            return Err(SubmitError::ShuttingDown);
        }
        if let Some(slot) = state.entities.get(&task.entity) {
            return Err(SubmitError::DuplicateRejected {
                existing: slot.handle.clone(),
            });
        }
        if state.pending.len() >= self.capacity {
            return Err(SubmitError::QueueSaturated {
                capacity: self.capacity,
            });
        }

        let id = TaskId(state.next_id);
        state.next_id += 1;
        let (state_tx, state_rx) = watch::channel(TaskState::Queued);
        let handle = TaskHandle::new(id, task.entity, task.priority, state_rx);

        self.publish(TaskEvent::Queued {
            id,
            entity: task.entity,
            priority: task.priority,
        });
        state.entities.insert(
            task.entity,
            EntitySlot {
                handle: handle.clone(),
                running: false,
            },
        );
        state.pending.push(PendingTask { id, task, state_tx });
        Ok(handle)
    }

    /// Pops the highest-priority pending task and marks it running in the
    /// same critical section.
    pub fn claim(&self) -> Option<ClaimedTask> {
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        let PendingTask { id, task, state_tx } = state.pending.pop()?;
        if let Some(slot) = state.entities.get_mut(&task.entity) {
            slot.running = true;
        }
        state_tx.send_replace(TaskState::Running);
        self.publish(TaskEvent::Started {
            id,
            entity: task.entity,
        });
        Some(ClaimedTask { id, task, state_tx })
    }

    /// Waits for the next claimable task. Returns `None` once `shutdown` is
    /// cancelled and nothing is pending.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<ClaimedTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.claim() {
                return Some(claimed);
            }
            if shutdown.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Releases the entity and publishes the result to the handle and to
    /// subscribers.
    pub fn complete(&self, claimed: ClaimedTask, result: PipelineResult) {
        let ClaimedTask { id, task, state_tx } = claimed;
        let succeeded = result.overall_succeeded;
        let mut state = self.state.lock().expect("task queue mutex poisoned");
        state.entities.remove(&task.entity);
        state_tx.send_replace(TaskState::Finished(Arc::new(result)));
        self.publish(TaskEvent::Finished {
            id,
            entity: task.entity,
            succeeded,
        });
    }

    /// Stops admission and cancels every pending task. Running tasks are left
    /// to finish. Returns the number of cancelled tasks.
    pub fn close(&self) -> usize {
        let cancelled: usize = {
            let mut state = self.state.lock().expect("task queue mutex poisoned");
            state.accepting = false;
            let drained: Vec<PendingTask> = state.pending.drain().collect();
            for pending in &drained {
                state.entities.remove(&pending.task.entity);
                pending.state_tx.send_replace(TaskState::Cancelled);
                self.publish(TaskEvent::Cancelled {
                    id: pending.id,
                    entity: pending.task.entity,
                });
            }
            drained.len()
        };

        self.notify.notify_waiters();
        self.telemetry.record_cancelled(cancelled as u64);
        cancelled
    }

    pub fn is_accepting(&self) -> bool {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .accepting
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .pending
            .len()
    }

    pub fn running_len(&self) -> usize {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .entities
            .values()
            .filter(|slot| slot.running)
            .count()
    }

    /// Handle of the unresolved task for `entity`, if any.
    pub fn handle(&self, entity: EntityRef) -> Option<TaskHandle> {
        self.state
            .lock()
            .expect("task queue mutex poisoned")
            .entities
            .get(&entity)
            .map(|slot| slot.handle.clone())
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.lock().expect("task queue mutex poisoned");
        let mut pending = PendingCounts::default();
        for task in state.pending.iter() {
            pending.bump(task.task.priority);
        }

        let mut in_flight: Vec<InFlightTask> = state
            .entities
            .iter()
            .map(|(entity, slot)| InFlightTask {
                id: slot.handle.id(),
                entity: *entity,
                priority: slot.handle.priority(),
                running: slot.running,
            })
            .collect();
        in_flight.sort_by_key(|task| task.id);

        QueueStatus {
            accepting: state.accepting,
            capacity: self.capacity,
            pending,
            running: in_flight.iter().filter(|task| task.running).count(),
            in_flight,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}
