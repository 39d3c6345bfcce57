use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationError;
use crate::energy::SamplerError;
use crate::isolation::IsolationError;
use crate::lock::LockError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

pub const ERROR_VALIDATION_FAILED: &str = "validation_failed";
pub const ERROR_MEMORY_EXCEEDED: &str = "memory_exceeded";
pub const ERROR_TIMEOUT: &str = "timeout";
pub const ERROR_ISOLATION: &str = "isolation_error";
pub const ERROR_LOCK_BUSY: &str = "lock_busy";
pub const ERROR_LOCK_LOST: &str = "lock_lost";
pub const ERROR_CALIBRATION: &str = "calibration_stale_or_missing";
pub const ERROR_ALL_TRIALS_FAILED: &str = "all_trials_failed";
pub const ERROR_SAMPLER: &str = "sampler_error";
pub const ERROR_CANCELLED: &str = "cancelled";
pub const ERROR_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_INTERNAL: &str = "internal";

/// Machine-readable failure code carried by every terminal `failed` task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ValidationFailed,
    MemoryExceeded,
    Timeout,
    IsolationError,
    LockBusy,
    LockLost,
    CalibrationStaleOrMissing,
    AllTrialsFailed,
    SamplerError,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl ErrorType {
    /// Wire representation, identical to the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => ERROR_VALIDATION_FAILED,
            Self::MemoryExceeded => ERROR_MEMORY_EXCEEDED,
            Self::Timeout => ERROR_TIMEOUT,
            Self::IsolationError => ERROR_ISOLATION,
            Self::LockBusy => ERROR_LOCK_BUSY,
            Self::LockLost => ERROR_LOCK_LOST,
            Self::CalibrationStaleOrMissing => ERROR_CALIBRATION,
            Self::AllTrialsFailed => ERROR_ALL_TRIALS_FAILED,
            Self::SamplerError => ERROR_SAMPLER,
            Self::Cancelled => ERROR_CANCELLED,
            Self::InvalidRequest => ERROR_INVALID_REQUEST,
            Self::Internal => ERROR_INTERNAL,
        }
    }

    /// Whether the external job layer may resubmit the same request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockBusy | Self::LockLost)
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single measurement request after it has been accepted.
///
/// Every variant maps onto exactly one [`ErrorType`]. These errors abort the
/// current request only; the worker process keeps running.
#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("Solution validation failed: {summary}")]
    ValidationFailed { summary: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("All {attempted} measurement trials failed; last error: {last_error}")]
    AllTrialsFailed { attempted: u32, last_error: String },

    /// Every measured trial hit the wall-clock limit.
    #[error("All {attempted} measurement trials exceeded the wall-clock limit")]
    TrialsTimedOut { attempted: u32 },

    /// Every measured trial hit the memory limit.
    #[error("All {attempted} measurement trials exceeded the memory limit")]
    TrialsOutOfMemory { attempted: u32 },

    #[error("Measurement cancelled after {completed_trials} measured trials")]
    Cancelled { completed_trials: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeasurementError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ValidationFailed { .. } => ErrorType::ValidationFailed,
            Self::InvalidRequest(_) => ErrorType::InvalidRequest,
            Self::Calibration(_) => ErrorType::CalibrationStaleOrMissing,
            Self::Isolation(_) => ErrorType::IsolationError,
            Self::Lock(LockError::Lost { .. }) => ErrorType::LockLost,
            Self::Lock(_) => ErrorType::LockBusy,
            Self::Sampler(_) => ErrorType::SamplerError,
            Self::AllTrialsFailed { .. } => ErrorType::AllTrialsFailed,
            Self::TrialsTimedOut { .. } => ErrorType::Timeout,
            Self::TrialsOutOfMemory { .. } => ErrorType::MemoryExceeded,
            Self::Cancelled { .. } => ErrorType::Cancelled,
            Self::Internal(_) => ErrorType::Internal,
        }
    }
}

impl From<CoreError> for MeasurementError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::InvalidRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
