//! Tunables for the measured-trial loop.

use std::time::Duration;

use crate::error::CoreError;
use crate::stats::MIN_SAMPLES_FOR_CV;

pub const DEFAULT_TARGET_CV: f64 = 0.05;
pub const DEFAULT_MIN_TRIAL_SECONDS: f64 = 0.2;
pub const DEFAULT_TRIAL_COOLDOWN: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_TRIAL_RETRIES: u32 = 2;

/// Stopping rule and pacing of measured trials.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialPolicy {
    /// Stop early once the CV of trial totals drops below this.
    pub target_cv: f64,
    /// Samples required before the CV is evaluated (at least 2).
    pub min_samples: usize,
    /// Each trial repeats the workload until its window lasts this long.
    pub min_trial_seconds: f64,
    /// Pause between consecutive trials.
    pub cooldown: Duration,
    /// Extra attempts granted to a trial slot whose attempt failed.
    pub max_retries_per_trial: u32,
    /// Subtract the calibration's DRAM idle baseline when it has one.
    pub dram_baseline: bool,
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self {
            target_cv: DEFAULT_TARGET_CV,
            min_samples: MIN_SAMPLES_FOR_CV,
            min_trial_seconds: DEFAULT_MIN_TRIAL_SECONDS,
            cooldown: DEFAULT_TRIAL_COOLDOWN,
            max_retries_per_trial: DEFAULT_MAX_TRIAL_RETRIES,
            dram_baseline: false,
        }
    }
}

impl TrialPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.target_cv.is_finite() || self.target_cv <= 0.0 {
            return Err(CoreError::Validation("target_cv must be positive".into()));
        }
        if !self.min_trial_seconds.is_finite() || self.min_trial_seconds < 0.0 {
            return Err(CoreError::Validation(
                "min_trial_seconds must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// `min_samples`, clamped so a CV is always computable.
    pub fn effective_min_samples(&self) -> usize {
        self.min_samples.max(MIN_SAMPLES_FOR_CV)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let policy = TrialPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.target_cv, 0.05);
        assert_eq!(policy.cooldown, Duration::from_millis(500));
    }

    #[test]
    fn min_samples_never_below_two() {
        let policy = TrialPolicy {
            min_samples: 0,
            ..Default::default()
        };
        assert_eq!(policy.effective_min_samples(), 2);
    }

    #[test]
    fn rejects_non_positive_target() {
        let policy = TrialPolicy {
            target_cv: 0.0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
