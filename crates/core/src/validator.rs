//! Correctness gate.
//!
//! Runs the candidate once per test case in a fresh sandbox and compares each
//! output structurally against the expected value. Failures are recorded per
//! test; evaluation never stops early.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::compare::outputs_match;
use crate::request::{MeasurementRequest, TestCase};
use crate::sandbox::{CandidateRunner, HarnessReply, RunJob, SandboxError};
use crate::validation::{TestFailureKind, TestOutcome, ValidationOutcome};

pub struct CorrectnessValidator<R> {
    runner: Arc<R>,
}

impl<R> Clone for CorrectnessValidator<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: CandidateRunner> CorrectnessValidator<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    /// Evaluate every test case of `request`.
    pub async fn validate(&self, request: &MeasurementRequest) -> ValidationOutcome {
        let timeout = Duration::from_secs(request.timeout_seconds);

        // One pre-flight load catches syntax errors and a missing function
        // without paying for a subprocess per test.
        let preflight = self
            .runner
            .check(
                &request.candidate_source,
                &request.function_name,
                timeout,
                request.memory_limit_mb,
            )
            .await;
        if let Some((kind, message)) = preflight_failure(preflight) {
            tracing::info!(
                kind = kind.as_str(),
                message = %message,
                "Candidate failed pre-flight load",
            );
            let tests = request
                .test_cases
                .iter()
                .map(|tc| TestOutcome::failed(&tc.id, kind, message.clone()))
                .collect();
            return ValidationOutcome::from_tests(tests);
        }

        let mut tests = Vec::with_capacity(request.test_cases.len());
        for tc in &request.test_cases {
            let job = RunJob::run(
                &request.candidate_source,
                &request.function_name,
                vec![tc.inputs.clone()],
                timeout,
                request.memory_limit_mb,
            );
            let result = self.runner.run(job).await;
            let outcome = outcome_for(tc, result);
            if !outcome.passed {
                tracing::debug!(
                    test_id = %tc.id,
                    kind = outcome.failure_kind().map(|k| k.as_str()),
                    "Test case failed",
                );
            }
            tests.push(outcome);
        }

        let outcome = ValidationOutcome::from_tests(tests);
        tracing::info!(
            passed = outcome.passed_count,
            total = outcome.total_count,
            is_correct = outcome.is_correct,
            "Correctness validation finished",
        );
        outcome
    }
}

fn preflight_failure(
    result: Result<HarnessReply, SandboxError>,
) -> Option<(TestFailureKind, String)> {
    match result {
        Ok(HarnessReply::Ok { .. }) => None,
        Ok(HarnessReply::LoadError { message }) | Ok(HarnessReply::Exception { message, .. }) => {
            Some((TestFailureKind::LoadError, message))
        }
        Ok(HarnessReply::MemoryExceeded { message }) => {
            Some((TestFailureKind::MemoryExceeded, message))
        }
        Err(e) => Some(sandbox_failure(&e)),
    }
}

fn sandbox_failure(err: &SandboxError) -> (TestFailureKind, String) {
    let kind = match err {
        SandboxError::Timeout { .. } => TestFailureKind::Timeout,
        e if e.is_memory_crash() => TestFailureKind::MemoryExceeded,
        _ => TestFailureKind::Crashed,
    };
    (kind, err.to_string())
}

/// Map one sandbox result onto a test outcome.
fn outcome_for(tc: &TestCase, result: Result<HarnessReply, SandboxError>) -> TestOutcome {
    match result {
        Ok(HarnessReply::Ok { outputs, .. }) => {
            let actual = outputs
                .and_then(|o| o.into_iter().next())
                .unwrap_or(Value::Null);
            if outputs_match(&tc.expected_output, &actual, tc.tolerance) {
                TestOutcome::pass(&tc.id, actual)
            } else {
                TestOutcome::wrong_answer(&tc.id, actual, &tc.expected_output)
            }
        }
        Ok(HarnessReply::Exception { message, .. }) => {
            TestOutcome::failed(&tc.id, TestFailureKind::Exception, message)
        }
        Ok(HarnessReply::LoadError { message }) => {
            TestOutcome::failed(&tc.id, TestFailureKind::LoadError, message)
        }
        Ok(HarnessReply::MemoryExceeded { message }) => {
            TestOutcome::failed(&tc.id, TestFailureKind::MemoryExceeded, message)
        }
        Err(e) => {
            let (kind, message) = sandbox_failure(&e);
            TestOutcome::failed(&tc.id, kind, message)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
