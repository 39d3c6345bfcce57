//! In-process task lifecycle events.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel. Publishing never
//! blocks and never fails from the publisher's point of view; subscribers
//! that fall behind see `RecvError::Lagged` and skip ahead.

use chrono::Utc;
use joulegate_core::task::{MeasurementTask, TaskProgress};
use joulegate_core::types::{TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_CAPACITY: usize = 1024;

pub const EVENT_TASK_QUEUED: &str = "task.queued";
pub const EVENT_TASK_RUNNING: &str = "task.running";
pub const EVENT_TASK_PROGRESS: &str = "task.progress";
pub const EVENT_TASK_COMPLETED: &str = "task.completed";
pub const EVENT_TASK_FAILED: &str = "task.failed";

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// One change to a measurement task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Dot-separated event name, e.g. `task.completed`.
    pub event_type: String,
    pub task_id: TaskId,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl TaskEvent {
    pub fn new(event_type: impl Into<String>, task_id: TaskId) -> Self {
        Self {
            event_type: event_type.into(),
            task_id,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Progress update for a running task.
    pub fn progress(task_id: TaskId, progress: TaskProgress) -> Self {
        Self::new(EVENT_TASK_PROGRESS, task_id).with_payload(json!(progress))
    }

    /// Terminal event carrying the final record.
    pub fn terminal(task: &MeasurementTask) -> Self {
        let event_type = match task.error_type {
            Some(_) => EVENT_TASK_FAILED,
            None => EVENT_TASK_COMPLETED,
        };
        let payload = serde_json::to_value(task).unwrap_or(Value::Null);
        Self::new(event_type, task.task_id).with_payload(payload)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let event_type = event.event_type.clone();
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(event_type = %event_type, receivers, "Task event published");
            }
            Err(_) => {
                tracing::trace!(event_type = %event_type, "Task event dropped, no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
