//! Correctness verdicts: per-test outcomes and the aggregate gate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a single test case did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFailureKind {
    /// Ran to completion but returned a different value.
    WrongAnswer,
    /// Exceeded the per-test wall-clock deadline.
    Timeout,
    /// Hit the address-space ceiling.
    MemoryExceeded,
    /// Child died without a structured reply (signal, abnormal exit).
    Crashed,
    /// The candidate function raised.
    Exception,
    /// Source failed to compile or the function was not found.
    LoadError,
}

impl TestFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrongAnswer => "wrong_answer",
            Self::Timeout => "timeout",
            Self::MemoryExceeded => "memory_exceeded",
            Self::Crashed => "crashed",
            Self::Exception => "exception",
            Self::LoadError => "load_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    pub kind: TestFailureKind,
    pub message: String,
}

/// Result of running one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
}

impl TestOutcome {
    pub fn pass(test_id: impl Into<String>, actual: Value) -> Self {
        Self {
            test_id: test_id.into(),
            passed: true,
            actual_output: Some(actual),
            error: None,
        }
    }

    pub fn wrong_answer(test_id: impl Into<String>, actual: Value, expected: &Value) -> Self {
        Self {
            test_id: test_id.into(),
            passed: false,
            error: Some(TestError {
                kind: TestFailureKind::WrongAnswer,
                message: format!("Expected {expected}, got {actual}"),
            }),
            actual_output: Some(actual),
        }
    }

    pub fn failed(
        test_id: impl Into<String>,
        kind: TestFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            passed: false,
            actual_output: None,
            error: Some(TestError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn failure_kind(&self) -> Option<TestFailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Aggregate verdict over every test case. No partial credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub tests: Vec<TestOutcome>,
    pub passed_count: usize,
    pub total_count: usize,
    pub is_correct: bool,
}

impl ValidationOutcome {
    pub fn from_tests(tests: Vec<TestOutcome>) -> Self {
        let passed_count = tests.iter().filter(|t| t.passed).count();
        let total_count = tests.len();
        Self {
            is_correct: total_count > 0 && passed_count == total_count,
            tests,
            passed_count,
            total_count,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.passed_count as f64 / self.total_count as f64
    }

    /// Short human-readable summary, e.g. `1/2 tests passed (t2: wrong_answer)`.
    pub fn summary(&self) -> String {
        let failures: Vec<String> = self
            .tests
            .iter()
            .filter(|t| !t.passed)
            .map(|t| match t.failure_kind() {
                Some(kind) => format!("{}: {}", t.test_id, kind.as_str()),
                None => t.test_id.clone(),
            })
            .collect();

        if failures.is_empty() {
            format!("{}/{} tests passed", self.passed_count, self.total_count)
        } else {
            format!(
                "{}/{} tests passed ({})",
                self.passed_count,
                self.total_count,
                failures.join(", ")
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
