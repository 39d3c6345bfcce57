//! Idle-baseline calibration profile.
//!
//! The profile is produced offline and only consumed here. A missing,
//! malformed or expired profile is a hard refusal to measure.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::types::{CpuId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_CALIBRATION_PATH: &str = "config/calibration.json";

/// Profiles older than this are rejected unless the artifact overrides it.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;

/// Tolerated clock skew for `generated_at` values in the future.
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Highest artifact version this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Calibration profile not found at {path}")]
    Missing { path: PathBuf },

    #[error("Failed to read calibration profile {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Calibration profile {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Calibration profile is invalid: {0}")]
    Invalid(String),

    #[error("Calibration profile expired: {age_days} days old, max {max_age_days}")]
    Stale { age_days: i64, max_age_days: i64 },

    #[error("Calibration profile timestamp {generated_at} is in the future")]
    FromFuture { generated_at: Timestamp },
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Isolated core every measurement is pinned to.
    pub measurement_core: CpuId,
    #[serde(default)]
    pub socket_id: u32,
    #[serde(alias = "idle_power_watts")]
    pub package_idle_watts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dram_idle_watts: Option<f64>,
    #[serde(alias = "timestamp")]
    pub generated_at: Timestamp,
    #[serde(
        default,
        alias = "valid_until_days",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age_days: Option<i64>,
    /// Variability of the idle readings the profile was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv_percent: Option<f64>,
}

fn default_version() -> u32 {
    SUPPORTED_VERSION
}

impl CalibrationProfile {
    /// Read and structurally check the profile at `path`.
    ///
    /// Freshness is checked separately by [`check_fresh`](Self::check_fresh).
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CalibrationError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(CalibrationError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let profile: Self =
            serde_json::from_str(&raw).map_err(|e| CalibrationError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        if self.version == 0 || self.version > SUPPORTED_VERSION {
            return Err(CalibrationError::Invalid(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if !self.package_idle_watts.is_finite() || self.package_idle_watts <= 0.0 {
            return Err(CalibrationError::Invalid(
                "package_idle_watts must be positive".to_string(),
            ));
        }
        if let Some(dram) = self.dram_idle_watts {
            if !dram.is_finite() || dram < 0.0 {
                return Err(CalibrationError::Invalid(
                    "dram_idle_watts must be non-negative".to_string(),
                ));
            }
        }
        if let Some(days) = self.max_age_days {
            if days <= 0 {
                return Err(CalibrationError::Invalid(
                    "max_age_days must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::days(self.max_age_days.unwrap_or(DEFAULT_MAX_AGE_DAYS))
    }

    /// Reject the profile if it is older than its maximum age at `now`.
    pub fn check_fresh(&self, now: Timestamp) -> Result<(), CalibrationError> {
        let age = now - self.generated_at;
        if age < -Duration::seconds(MAX_FUTURE_SKEW_SECS) {
            return Err(CalibrationError::FromFuture {
                generated_at: self.generated_at,
            });
        }
        if age > self.max_age() {
            return Err(CalibrationError::Stale {
                age_days: age.num_days(),
                max_age_days: self.max_age().num_days(),
            });
        }
        Ok(())
    }

    /// Idle package energy expected over `seconds`.
    pub fn package_baseline_joules(&self, seconds: f64) -> f64 {
        self.package_idle_watts * seconds
    }

    /// Idle DRAM energy over `seconds`, when the profile carries a DRAM baseline.
    pub fn dram_baseline_joules(&self, seconds: f64) -> Option<f64> {
        self.dram_idle_watts.map(|w| w * seconds)
    }
}

/// Load the profile at `path` and check it is fresh at `now`.
pub fn load_fresh(path: &Path, now: Timestamp) -> Result<CalibrationProfile, CalibrationError> {
    let profile = CalibrationProfile::load(path)?;
    profile.check_fresh(now)?;
    Ok(profile)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
