//! Task records owned by the worker process.
//!
//! Each mutation goes through [`MeasurementTask`]'s transition checks and
//! emits the matching [`TaskEvent`] once the write has been applied.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use joulegate_core::error::CoreError;
use joulegate_core::request::MeasurementRequest;
use joulegate_core::task::{MeasurementTask, TaskOutcome, TaskProgress};
use joulegate_core::types::{new_task_id, TaskId};
use serde_json::json;
use tokio::sync::broadcast;

use crate::events::{EventBus, TaskEvent, EVENT_TASK_QUEUED, EVENT_TASK_RUNNING};

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, MeasurementTask>>,
    events: EventBus,
}

impl TaskRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, MeasurementTask>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, MeasurementTask>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new `queued` task for `request`.
    pub fn submit(&self, request: &MeasurementRequest) -> TaskId {
        let task_id = new_task_id();
        let task = MeasurementTask::queued(task_id)
            .with_labels(request.candidate_id.clone(), request.problem_name.clone());
        self.write().insert(task_id, task);

        tracing::info!(
            task_id = %task_id,
            candidate_id = request.candidate_id.as_deref(),
            problem_name = request.problem_name.as_deref(),
            test_cases = request.test_cases.len(),
            "Measurement task queued",
        );
        self.events.publish(TaskEvent::new(EVENT_TASK_QUEUED, task_id).with_payload(json!({
            "candidate_id": request.candidate_id,
            "problem_name": request.problem_name,
        })));
        task_id
    }

    /// Snapshot of the task record.
    pub fn get_state(&self, task_id: TaskId) -> Result<MeasurementTask, CoreError> {
        self.read()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| not_found(task_id))
    }

    pub fn start(&self, task_id: TaskId) -> Result<(), CoreError> {
        self.with_task(task_id, MeasurementTask::start)?;
        self.events.publish(TaskEvent::new(EVENT_TASK_RUNNING, task_id));
        Ok(())
    }

    pub fn update_progress(
        &self,
        task_id: TaskId,
        progress: TaskProgress,
    ) -> Result<(), CoreError> {
        self.with_task(task_id, |task| task.set_progress(progress))?;
        self.events.publish(TaskEvent::progress(task_id, progress));
        Ok(())
    }

    /// Move the task to its terminal state and return the final record.
    pub fn finish(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> Result<MeasurementTask, CoreError> {
        let task = self.with_task(task_id, |task| {
            task.finish(outcome)?;
            Ok(task.clone())
        })?;
        match (&task.error_type, &task.error_message) {
            (Some(error_type), message) => tracing::warn!(
                task_id = %task_id,
                error_type = %error_type,
                message = message.as_deref().unwrap_or_default(),
                "Measurement task failed",
            ),
            (None, _) => tracing::info!(task_id = %task_id, "Measurement task completed"),
        }
        self.events.publish(TaskEvent::terminal(&task));
        Ok(task)
    }

    fn with_task<T>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut MeasurementTask) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut tasks = self.write();
        let task = tasks.get_mut(&task_id).ok_or_else(|| not_found(task_id))?;
        f(task)
    }
}

fn not_found(task_id: TaskId) -> CoreError {
    CoreError::NotFound {
        entity: "measurement_task",
        id: task_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
