//! Warmup and measured trials.
//!
//! The orchestrator is a small state machine:
//!
//! ```text
//! Warmup{n} -> ... -> Warmup{1} -> Measuring{1} -> ... -> Measuring{N}
//!                                       |                      |
//!                                       +--> Converged         +--> Exhausted
//! ```
//!
//! Every trial spawns a fresh child, waits for it to load, and only then
//! opens the energy window. The window closes when the reply line arrives
//! and the child is reaped afterwards, so interpreter start-up and teardown
//! never land in the counters.
//!
//! The lease is kept alive while a trial runs and renewed once more before
//! its sample is accepted. A lost lease abandons the trial and fails the
//! measurement. Cancellation is observed between trials only.

use std::sync::Arc;
use std::time::Duration;

use joulegate_core::energy::{EnergySampler, SamplerError, TrialSample, WindowError};
use joulegate_core::error::{ErrorType, MeasurementError};
use joulegate_core::isolation::IsolationError;
use joulegate_core::lock::{LockError, LockHandle, ResourceLock};
use joulegate_core::metrics::TrialRecord;
use joulegate_core::policy::TrialPolicy;
use joulegate_core::request::MeasurementRequest;
use joulegate_core::sandbox::{CandidateRunner, HarnessReply, PreparedRun, RunJob, SandboxError};
use joulegate_core::stats::coefficient_of_variation;
use joulegate_core::task::{Phase, TaskProgress};
use joulegate_core::types::CpuId;
use tokio_util::sync::CancellationToken;

/// Where the trial loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    /// Warmup trials still to run, counting down.
    Warmup { remaining: u32 },
    /// 1-based measured trial slot about to run.
    Measuring { trial: u32 },
    /// The CV target was met early.
    Converged,
    /// Every configured slot was used.
    Exhausted,
}

impl TrialPhase {
    pub fn initial(warmup_trials: u32) -> Self {
        if warmup_trials > 0 {
            Self::Warmup {
                remaining: warmup_trials,
            }
        } else {
            Self::Measuring { trial: 1 }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Exhausted)
    }
}

/// Accepted trials and how the loop ended.
#[derive(Debug, Clone)]
pub struct TrialRun {
    pub records: Vec<TrialRecord>,
    pub converged: bool,
    pub failed_trials: u32,
    pub coefficient_of_variation: Option<f64>,
}

/// Why a single trial attempt produced no sample.
#[derive(Debug, thiserror::Error)]
enum TrialFailure {
    #[error(transparent)]
    Sandbox(SandboxError),

    #[error("candidate failed during trial: {}", .0.describe())]
    Candidate(HarnessReply),

    #[error(transparent)]
    Sampler(SamplerError),

    #[error(transparent)]
    Isolation(IsolationError),
}

impl TrialFailure {
    /// Resource limit behind this failure, if any.
    fn limit(&self) -> Option<ErrorType> {
        match self {
            Self::Sandbox(SandboxError::Timeout { .. }) => Some(ErrorType::Timeout),
            Self::Sandbox(e) if e.is_memory_crash() => Some(ErrorType::MemoryExceeded),
            Self::Candidate(HarnessReply::MemoryExceeded { .. }) => Some(ErrorType::MemoryExceeded),
            _ => None,
        }
    }
}

impl From<SandboxError> for TrialFailure {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Isolation(e) => Self::Isolation(e),
            other => Self::Sandbox(other),
        }
    }
}

/// Everything one request's trial loop needs besides the orchestrator.
pub struct TrialContext<'a> {
    pub request: &'a MeasurementRequest,
    pub core: CpuId,
    pub lock: &'a ResourceLock,
    pub cancel: &'a CancellationToken,
}

pub struct TrialOrchestrator<R> {
    runner: Arc<R>,
    sampler: EnergySampler,
    policy: TrialPolicy,
}

impl<R: CandidateRunner> TrialOrchestrator<R> {
    pub fn new(runner: Arc<R>, sampler: EnergySampler, policy: TrialPolicy) -> Self {
        Self {
            runner,
            sampler,
            policy,
        }
    }

    /// Run warmup then measured trials until converged or exhausted.
    ///
    /// Failed attempts are retried within their slot up to the policy's
    /// limit. Isolation failures abort at once.
    pub async fn run(
        &self,
        ctx: TrialContext<'_>,
        handle: &mut LockHandle,
        on_progress: &(dyn Fn(TaskProgress) + Send + Sync),
    ) -> Result<TrialRun, MeasurementError> {
        let warmup_total = ctx.request.warmup_trials;
        let measured_total = ctx.request.energy_measurement_trials;
        let min_samples = self.policy.effective_min_samples();

        let mut phase = TrialPhase::initial(warmup_total);
        let mut records: Vec<TrialRecord> = Vec::new();
        let mut failed_trials = 0u32;
        let mut slot_retries = 0u32;
        let mut last_error = String::new();
        let mut limits: Vec<Option<ErrorType>> = Vec::new();
        let mut cv = None;

        while !phase.is_terminal() {
            if ctx.cancel.is_cancelled() {
                tracing::info!(completed = records.len(), "Measurement cancelled");
                return Err(MeasurementError::Cancelled {
                    completed_trials: records.len() as u32,
                });
            }
            ctx.lock.renew(handle).await?;

            phase = match phase {
                TrialPhase::Warmup { remaining } => {
                    on_progress(TaskProgress {
                        phase: Phase::Warmup,
                        current: warmup_total - remaining + 1,
                        total: warmup_total,
                    });
                    match self.leased_attempt(&ctx, handle).await? {
                        Ok(_) => {}
                        Err(TrialFailure::Isolation(e)) => return Err(e.into()),
                        Err(e) => tracing::warn!(error = %e, "Warmup trial failed"),
                    }
                    if remaining > 1 {
                        TrialPhase::Warmup {
                            remaining: remaining - 1,
                        }
                    } else {
                        TrialPhase::Measuring { trial: 1 }
                    }
                }
                TrialPhase::Measuring { trial } => {
                    on_progress(TaskProgress {
                        phase: Phase::Measuring,
                        current: trial,
                        total: measured_total,
                    });
                    match self.leased_attempt(&ctx, handle).await? {
                        Ok(sample) => {
                            slot_retries = 0;
                            let net = self.sampler.net(&sample);
                            let record = TrialRecord::new(
                                trial,
                                sample.started_at,
                                sample.finished_at,
                                net,
                                sample.repeat_count,
                            );
                            tracing::debug!(
                                trial,
                                package_joules = record.package_joules,
                                dram_joules = record.dram_joules,
                                seconds = record.seconds,
                                repeat_count = record.repeat_count,
                                "Trial recorded",
                            );
                            records.push(record);

                            let totals: Vec<f64> =
                                records.iter().map(TrialRecord::total_joules).collect();
                            cv = coefficient_of_variation(&totals);
                            let enough = records.len() >= min_samples;
                            match cv {
                                Some(c) if enough && c < self.policy.target_cv => {
                                    tracing::info!(
                                        trials = records.len(),
                                        cv = c,
                                        "Trials converged",
                                    );
                                    TrialPhase::Converged
                                }
                                _ => next_slot(trial, measured_total),
                            }
                        }
                        Err(TrialFailure::Isolation(e)) => return Err(e.into()),
                        Err(e) => {
                            failed_trials += 1;
                            last_error = e.to_string();
                            limits.push(e.limit());
                            if slot_retries < self.policy.max_retries_per_trial {
                                slot_retries += 1;
                                tracing::warn!(
                                    trial,
                                    retry = slot_retries,
                                    error = %e,
                                    "Trial failed, retrying",
                                );
                                TrialPhase::Measuring { trial }
                            } else {
                                slot_retries = 0;
                                tracing::warn!(
                                    trial,
                                    error = %e,
                                    "Trial failed, retries exhausted",
                                );
                                next_slot(trial, measured_total)
                            }
                        }
                    }
                }
                terminal => terminal,
            };

            if !phase.is_terminal() {
                self.cool_down(ctx.cancel).await;
            }
        }

        if records.is_empty() {
            return Err(exhausted_error(failed_trials, last_error, &limits));
        }

        Ok(TrialRun {
            converged: phase == TrialPhase::Converged,
            records,
            failed_trials,
            coefficient_of_variation: cv,
        })
    }

    /// One trial run beside the lease heartbeat.
    ///
    /// The outer error is a lost or unreachable lease; the trial's own
    /// outcome is only returned once the lease is confirmed to still be held.
    async fn leased_attempt(
        &self,
        ctx: &TrialContext<'_>,
        handle: &mut LockHandle,
    ) -> Result<Result<TrialSample, TrialFailure>, LockError> {
        let outcome = tokio::select! {
            outcome = self.attempt(ctx) => outcome,
            err = ctx.lock.keep_alive(handle) => {
                tracing::error!(error = %err, "Lease lost during trial, abandoning it");
                return Err(err);
            }
        };
        ctx.lock.renew(handle).await?;
        Ok(outcome)
    }

    /// One trial: spawn and load, sample around the released workload, then
    /// reap the child outside the window.
    async fn attempt(&self, ctx: &TrialContext<'_>) -> Result<TrialSample, TrialFailure> {
        let request = ctx.request;
        let job = RunJob::run(
            &request.candidate_source,
            &request.function_name,
            request.call_list(),
            trial_timeout(request, self.policy.min_trial_seconds),
            request.memory_limit_mb,
        )
        .with_min_wall_seconds(self.policy.min_trial_seconds)
        .with_return_outputs(false)
        .pinned_to(ctx.core);

        let mut prepared = self.runner.prepare(job).await?;
        let child = &mut prepared;
        let sample = self
            .sampler
            .sample_window(move || async move {
                match child.run_workload().await {
                    Ok(HarnessReply::Ok { repeat_count, .. }) => Ok(repeat_count),
                    Ok(other) => Err(TrialFailure::Candidate(other)),
                    Err(e) => Err(TrialFailure::from(e)),
                }
            })
            .await
            .map_err(|e| match e {
                WindowError::Counters(e) => TrialFailure::Sampler(e),
                WindowError::Work(e) => e,
            });

        let reaped = prepared.finish().await;
        match (sample, reaped) {
            (Ok(sample), Ok(())) => Ok(sample),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), reaped) => {
                if let Err(reap) = reaped {
                    tracing::debug!(error = %reap, "Failed to reap trial child");
                }
                Err(e)
            }
        }
    }

    async fn cool_down(&self, cancel: &CancellationToken) {
        if self.policy.cooldown.is_zero() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.policy.cooldown) => {}
        }
    }
}

fn next_slot(trial: u32, total: u32) -> TrialPhase {
    if trial >= total {
        TrialPhase::Exhausted
    } else {
        TrialPhase::Measuring { trial: trial + 1 }
    }
}

/// Failure for a loop that accepted no sample. When every measured attempt
/// hit the same resource limit, that limit is the cause.
fn exhausted_error(
    attempted: u32,
    last_error: String,
    limits: &[Option<ErrorType>],
) -> MeasurementError {
    let uniform = match limits.split_first() {
        Some((first @ Some(_), rest)) if rest.iter().all(|l| l == first) => *first,
        _ => None,
    };
    match uniform {
        Some(ErrorType::Timeout) => MeasurementError::TrialsTimedOut { attempted },
        Some(ErrorType::MemoryExceeded) => MeasurementError::TrialsOutOfMemory { attempted },
        _ => MeasurementError::AllTrialsFailed {
            attempted,
            last_error,
        },
    }
}

/// Deadline for one trial child: every call may use its full timeout, on
/// top of the minimum window length.
fn trial_timeout(request: &MeasurementRequest, min_trial_seconds: f64) -> Duration {
    let per_pass = Duration::from_secs(request.timeout_seconds)
        .saturating_mul(request.test_cases.len().max(1) as u32);
    per_pass + Duration::from_secs_f64(min_trial_seconds.max(0.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use joulegate_core::request::TestCase;
    use serde_json::json;

    use super::*;

    #[test]
    fn initial_phase_skips_empty_warmup() {
        assert_eq!(TrialPhase::initial(0), TrialPhase::Measuring { trial: 1 });
        assert_eq!(
            TrialPhase::initial(2),
            TrialPhase::Warmup { remaining: 2 }
        );
    }

    #[test]
    fn last_slot_exhausts() {
        assert_eq!(next_slot(1, 3), TrialPhase::Measuring { trial: 2 });
        assert_eq!(next_slot(3, 3), TrialPhase::Exhausted);
        assert!(TrialPhase::Exhausted.is_terminal());
        assert!(!TrialPhase::Warmup { remaining: 1 }.is_terminal());
    }

    #[test]
    fn trial_timeout_covers_every_call() {
        let request = MeasurementRequest::new(
            "def solve(x):\n    return x\n",
            "solve",
            vec![
                TestCase::new("a", vec![json!(1)], json!(1)),
                TestCase::new("b", vec![json!(2)], json!(2)),
            ],
        )
        .with_limits(3, 256);
        assert_eq!(trial_timeout(&request, 0.5), Duration::from_millis(6500));
    }

    #[test]
    fn uniform_limit_becomes_the_cause() {
        let timeouts = [Some(ErrorType::Timeout); 3];
        let err = exhausted_error(3, "late".into(), &timeouts);
        assert_eq!(err.error_type(), ErrorType::Timeout);

        let oom = [Some(ErrorType::MemoryExceeded); 2];
        let err = exhausted_error(2, "big".into(), &oom);
        assert_eq!(err.error_type(), ErrorType::MemoryExceeded);
    }

    #[test]
    fn mixed_failures_stay_all_trials_failed() {
        let mixed = [Some(ErrorType::Timeout), None, Some(ErrorType::Timeout)];
        let err = exhausted_error(3, "counter read failed".into(), &mixed);
        assert_eq!(err.error_type(), ErrorType::AllTrialsFailed);
        assert!(err.to_string().contains("counter read failed"));

        let none = [None, None];
        let err = exhausted_error(2, "flaky".into(), &none);
        assert_eq!(err.error_type(), ErrorType::AllTrialsFailed);
    }

    #[test]
    fn failure_limits_are_classified() {
        let timeout = TrialFailure::from(SandboxError::Timeout { elapsed_ms: 5 });
        assert_eq!(timeout.limit(), Some(ErrorType::Timeout));

        let oom = TrialFailure::Candidate(HarnessReply::MemoryExceeded {
            message: "memory limit exceeded".into(),
        });
        assert_eq!(oom.limit(), Some(ErrorType::MemoryExceeded));

        let raised = TrialFailure::Candidate(HarnessReply::Exception {
            message: "RuntimeError: flaky".into(),
            call_index: Some(0),
        });
        assert_eq!(raised.limit(), None);
        assert!(raised.to_string().contains("RuntimeError"));
    }

    #[test]
    fn isolation_sandbox_error_is_not_retryable() {
        let failure = TrialFailure::from(SandboxError::Isolation(IsolationError::NoIsolatedCores));
        assert!(matches!(failure, TrialFailure::Isolation(_)));
        let failure = TrialFailure::from(SandboxError::Timeout { elapsed_ms: 1 });
        assert!(matches!(failure, TrialFailure::Sandbox(_)));
    }
}
