//! Measurement request and test case types.
//!
//! A [`MeasurementRequest`] is immutable once accepted: the pipeline only
//! ever borrows it. Structural checks run before the correctness gate so
//! that malformed submissions never reach the sandbox.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Function invoked when the submission does not name one.
pub const DEFAULT_FUNCTION_NAME: &str = "solve";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 512;
pub const DEFAULT_MEASUREMENT_TRIALS: u32 = 5;
pub const DEFAULT_WARMUP_TRIALS: u32 = 2;

/// Maximum number of test cases accepted in one request.
pub const MAX_TEST_CASES: usize = 1000;

/// Maximum length of a test case identifier.
const MAX_TEST_ID_LEN: usize = 128;

/// Maximum size of candidate source text in bytes.
pub const MAX_SOURCE_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One input/expected-output pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    /// Ordered positional arguments. `[2]` calls `f(2)`, never `f([2])`.
    pub inputs: Vec<Value>,
    pub expected_output: Value,
    /// Float tolerance for this case. `None` means exact comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, inputs: Vec<Value>, expected_output: Value) -> Self {
        Self {
            id: id.into(),
            inputs,
            expected_output,
            tolerance: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }
}

/// A submission: candidate code plus the test cases that gate measurement.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MeasurementRequest {
    #[validate(length(min = 1, max = 262144))]
    pub candidate_source: String,

    #[serde(default = "default_function_name")]
    #[validate(length(min = 1, max = 128))]
    pub function_name: String,

    #[validate(length(min = 1, max = 1000))]
    pub test_cases: Vec<TestCase>,

    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64,

    #[serde(default = "default_memory_limit_mb")]
    #[validate(range(min = 32, max = 8192))]
    pub memory_limit_mb: u64,

    #[serde(default = "default_measurement_trials")]
    #[validate(range(min = 1, max = 50))]
    pub energy_measurement_trials: u32,

    #[serde(default = "default_warmup_trials")]
    #[validate(range(max = 10))]
    pub warmup_trials: u32,

    /// External tracking label, echoed back on the task record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_id: Option<String>,

    /// Problem identifier, echoed back on the task record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_name: Option<String>,
}

fn default_function_name() -> String {
    DEFAULT_FUNCTION_NAME.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_memory_limit_mb() -> u64 {
    DEFAULT_MEMORY_LIMIT_MB
}

fn default_measurement_trials() -> u32 {
    DEFAULT_MEASUREMENT_TRIALS
}

fn default_warmup_trials() -> u32 {
    DEFAULT_WARMUP_TRIALS
}

impl MeasurementRequest {
    /// Build a request with default limits.
    pub fn new(
        candidate_source: impl Into<String>,
        function_name: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            candidate_source: candidate_source.into(),
            function_name: function_name.into(),
            test_cases,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            energy_measurement_trials: DEFAULT_MEASUREMENT_TRIALS,
            warmup_trials: DEFAULT_WARMUP_TRIALS,
            candidate_id: None,
            problem_name: None,
        }
    }

    pub fn with_trials(mut self, measured: u32, warmup: u32) -> Self {
        self.energy_measurement_trials = measured;
        self.warmup_trials = warmup;
        self
    }

    pub fn with_limits(mut self, timeout_seconds: u64, memory_limit_mb: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    /// Positional argument lists for every test case, in order.
    pub fn call_list(&self) -> Vec<Vec<Value>> {
        self.test_cases.iter().map(|tc| tc.inputs.clone()).collect()
    }

    /// Validate limits and test case structure.
    ///
    /// Rules beyond the declarative ranges:
    /// - Source must not be blank.
    /// - Function name must be a Python identifier.
    /// - Test ids must be non-empty, bounded, and unique.
    /// - Tolerances must be finite and non-negative.
    pub fn validate_request(&self) -> Result<(), CoreError> {
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        if self.candidate_source.trim().is_empty() {
            return Err(CoreError::Validation(
                "Candidate source must not be blank".to_string(),
            ));
        }

        if !is_identifier(&self.function_name) {
            return Err(CoreError::Validation(format!(
                "Function name '{}' is not a valid identifier",
                self.function_name
            )));
        }

        let mut seen = HashSet::with_capacity(self.test_cases.len());
        for (i, tc) in self.test_cases.iter().enumerate() {
            if tc.id.is_empty() {
                return Err(CoreError::Validation(format!(
                    "Test case at index {i} has an empty id"
                )));
            }
            if tc.id.len() > MAX_TEST_ID_LEN {
                return Err(CoreError::Validation(format!(
                    "Test case id at index {i} exceeds {MAX_TEST_ID_LEN} characters"
                )));
            }
            if !seen.insert(tc.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate test case id: \"{}\"",
                    tc.id
                )));
            }
            if let Some(tol) = tc.tolerance {
                if !tol.is_finite() || tol < 0.0 {
                    return Err(CoreError::Validation(format!(
                        "Test case \"{}\" has an invalid tolerance",
                        tc.id
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
