//! Summary statistics over trial samples.
//!
//! Medians are the headline figures; the coefficient of variation drives the
//! adaptive stopping rule.

use serde::{Deserialize, Serialize};

/// CV below which a result is reported with high confidence.
pub const HIGH_CONFIDENCE_CV: f64 = 0.05;

/// CV below which a result is reported with medium confidence.
pub const MEDIUM_CONFIDENCE_CV: f64 = 0.10;

/// Fewest samples for which a CV is meaningful.
pub const MIN_SAMPLES_FOR_CV: usize = 2;

/// Median of `values`, averaging the middle pair for even lengths.
///
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (Bessel-corrected). `None` below two samples.
pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < MIN_SAMPLES_FOR_CV {
        return None;
    }
    let m = mean(values)?;
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// `stddev / mean`. `None` below two samples or when the mean is zero.
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if m == 0.0 {
        return None;
    }
    let sd = sample_stddev(values)?;
    Some(sd / m.abs())
}

/// Qualitative reliability of an aggregated result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn assess(cv: Option<f64>, samples: usize, min_samples: usize) -> Self {
        match cv {
            Some(cv) if cv < HIGH_CONFIDENCE_CV && samples >= min_samples => Self::High,
            Some(cv) if cv < MEDIUM_CONFIDENCE_CV => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
