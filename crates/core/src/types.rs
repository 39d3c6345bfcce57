//! Shared type aliases.

use chrono::{DateTime, Utc};

/// Identifier of a measurement task (UUIDv7, time-ordered).
pub type TaskId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Logical CPU index as the kernel numbers it.
pub type CpuId = usize;

/// Allocate a fresh time-ordered task identifier.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::now_v7()
}
