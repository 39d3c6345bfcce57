//! Host readiness for an external health check.

use std::path::PathBuf;

use chrono::Utc;
use joulegate_core::calibration::load_fresh;
use joulegate_core::isolation::{CheckStatus, IsolationManager};
use joulegate_core::lock::ResourceLock;
use joulegate_core::types::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub calibration: CheckStatus,
    pub isolated_cores: CheckStatus,
    pub lock: CheckStatus,
    pub checked_at: Timestamp,
}

pub struct ReadinessProbe {
    calibration_path: PathBuf,
    isolation: IsolationManager,
    lock: ResourceLock,
}

impl ReadinessProbe {
    pub fn new(
        calibration_path: impl Into<PathBuf>,
        isolation: IsolationManager,
        lock: ResourceLock,
    ) -> Self {
        Self {
            calibration_path: calibration_path.into(),
            isolation,
            lock,
        }
    }

    /// Run every check. Never short-circuits.
    pub async fn check(&self) -> ReadinessReport {
        let now = Utc::now();
        let calibration = load_fresh(&self.calibration_path, now);
        let report = self
            .isolation
            .verify_preconditions(&calibration, &self.lock)
            .await;

        let ready = report.is_ready();
        if ready {
            tracing::debug!("Readiness check passed");
        } else {
            tracing::warn!(failures = ?report.failures(), "Host not ready to measure");
        }

        ReadinessReport {
            ready,
            calibration: report.calibration,
            isolated_cores: report.isolated_cores,
            lock: report.lock,
            checked_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
