//! Aggregated energy results.
//!
//! Headline figures are medians over accepted trials. Total energy is defined
//! as median package energy plus median DRAM energy, so the reported total
//! always equals the sum of its parts.

use serde::{Deserialize, Serialize};

use crate::energy::NetEnergy;
use crate::stats::{coefficient_of_variation, mean, median, sample_stddev, Confidence};
use crate::types::{CpuId, Timestamp};

/// One accepted measured trial, normalised to a single logical run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub index: u32,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub package_joules: f64,
    pub dram_joules: f64,
    pub seconds: f64,
    pub repeat_count: u64,
}

impl TrialRecord {
    pub fn new(
        index: u32,
        started_at: Timestamp,
        finished_at: Timestamp,
        net: NetEnergy,
        repeat_count: u64,
    ) -> Self {
        Self {
            index,
            started_at,
            finished_at,
            package_joules: net.package_joules,
            dram_joules: net.dram_joules,
            seconds: net.seconds,
            repeat_count,
        }
    }

    pub fn total_joules(&self) -> f64 {
        self.package_joules + self.dram_joules
    }
}

/// Conditions a result was measured under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEnvironment {
    pub measurement_core: CpuId,
    pub package_domain: String,
    pub dram_available: bool,
    pub dram_baseline_applied: bool,
    pub package_idle_watts: f64,
    pub calibration_generated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_temperature_celsius: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedEnergyMetrics {
    pub median_package_energy_joules: f64,
    pub median_dram_energy_joules: f64,
    pub median_total_energy_joules: f64,
    pub median_execution_time_seconds: f64,
    pub energy_per_test_case_joules: f64,
    pub power_consumption_watts: f64,
    pub trial_count_used: u32,
    /// `None` with fewer than two accepted trials.
    pub coefficient_of_variation: Option<f64>,
    pub mean_total_energy_joules: f64,
    pub stddev_total_energy_joules: Option<f64>,
    pub converged: bool,
    pub failed_trials: u32,
    pub confidence: Confidence,
    pub trials: Vec<TrialRecord>,
    pub environment: MeasurementEnvironment,
}

/// Inputs to [`AggregatedEnergyMetrics::aggregate`] beyond the trials.
#[derive(Debug, Clone)]
pub struct AggregationContext {
    pub test_case_count: usize,
    pub converged: bool,
    pub failed_trials: u32,
    pub min_samples: usize,
    pub environment: MeasurementEnvironment,
}

impl AggregatedEnergyMetrics {
    /// Summarise accepted trials. `None` when there are none.
    pub fn aggregate(trials: Vec<TrialRecord>, ctx: AggregationContext) -> Option<Self> {
        let package: Vec<f64> = trials.iter().map(|t| t.package_joules).collect();
        let dram: Vec<f64> = trials.iter().map(|t| t.dram_joules).collect();
        let seconds: Vec<f64> = trials.iter().map(|t| t.seconds).collect();
        let totals: Vec<f64> = trials.iter().map(TrialRecord::total_joules).collect();

        let median_package = median(&package)?;
        let median_dram = median(&dram)?;
        let median_seconds = median(&seconds)?;
        let median_total = median_package + median_dram;

        let cv = coefficient_of_variation(&totals);
        let energy_per_test_case = if ctx.test_case_count > 0 {
            median_total / ctx.test_case_count as f64
        } else {
            0.0
        };
        let power = if median_seconds > 0.0 {
            median_total / median_seconds
        } else {
            0.0
        };

        Some(Self {
            median_package_energy_joules: median_package,
            median_dram_energy_joules: median_dram,
            median_total_energy_joules: median_total,
            median_execution_time_seconds: median_seconds,
            energy_per_test_case_joules: energy_per_test_case,
            power_consumption_watts: power,
            trial_count_used: trials.len() as u32,
            coefficient_of_variation: cv,
            mean_total_energy_joules: mean(&totals)?,
            stddev_total_energy_joules: sample_stddev(&totals),
            converged: ctx.converged,
            failed_trials: ctx.failed_trials,
            confidence: Confidence::assess(cv, trials.len(), ctx.min_samples),
            trials,
            environment: ctx.environment,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn env() -> MeasurementEnvironment {
        MeasurementEnvironment {
            measurement_core: 3,
            package_domain: "package-0".into(),
            dram_available: true,
            dram_baseline_applied: false,
            package_idle_watts: 10.0,
            calibration_generated_at: Utc::now(),
            cpu_temperature_celsius: None,
        }
    }

    fn ctx(test_case_count: usize) -> AggregationContext {
        AggregationContext {
            test_case_count,
            converged: true,
            failed_trials: 0,
            min_samples: 3,
            environment: env(),
        }
    }

    fn trial(index: u32, package: f64, dram: f64, seconds: f64) -> TrialRecord {
        let now = Utc::now();
        TrialRecord {
            index,
            started_at: now,
            finished_at: now,
            package_joules: package,
            dram_joules: dram,
            seconds,
            repeat_count: 1,
        }
    }

    #[test]
    fn empty_trials_yield_nothing() {
        assert!(AggregatedEnergyMetrics::aggregate(vec![], ctx(2)).is_none());
    }

    #[test]
    fn total_is_sum_of_medians() {
        // Medians of the parts come from different trials.
        let trials = vec![
            trial(0, 1.0, 0.9, 0.10),
            trial(1, 2.0, 0.1, 0.20),
            trial(2, 3.0, 0.5, 0.30),
        ];
        let m = AggregatedEnergyMetrics::aggregate(trials, ctx(2)).unwrap();
        assert_eq!(m.median_package_energy_joules, 2.0);
        assert_eq!(m.median_dram_energy_joules, 0.5);
        assert_eq!(
            m.median_total_energy_joules,
            m.median_package_energy_joules + m.median_dram_energy_joules
        );
        assert_eq!(m.median_execution_time_seconds, 0.20);
        assert_eq!(m.energy_per_test_case_joules, 1.25);
        assert_eq!(
            m.power_consumption_watts,
            m.median_total_energy_joules / m.median_execution_time_seconds
        );
        assert_eq!(m.trial_count_used, 3);
    }

    #[test]
    fn single_trial_has_no_cv() {
        let m = AggregatedEnergyMetrics::aggregate(vec![trial(0, 1.0, 0.0, 0.1)], ctx(1)).unwrap();
        assert_eq!(m.coefficient_of_variation, None);
        assert_eq!(m.stddev_total_energy_joules, None);
        assert_eq!(m.confidence, Confidence::Low);
    }

    #[test]
    fn stable_trials_are_high_confidence() {
        let trials = (0..4).map(|i| trial(i, 1.0, 0.0, 0.1)).collect();
        let m = AggregatedEnergyMetrics::aggregate(trials, ctx(1)).unwrap();
        assert_eq!(m.coefficient_of_variation, Some(0.0));
        assert_eq!(m.confidence, Confidence::High);
    }

    #[test]
    fn zero_duration_reports_zero_power() {
        let m = AggregatedEnergyMetrics::aggregate(vec![trial(0, 1.0, 0.0, 0.0)], ctx(1)).unwrap();
        assert_eq!(m.power_consumption_watts, 0.0);
    }
}
