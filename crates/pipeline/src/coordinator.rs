//! Per-request measurement flow.
//!
//! 1. Structural request checks (`invalid_request`, task never runs).
//! 2. Correctness gate. Any failing test ends the task as `validation_failed`.
//! 3. Fresh calibration profile and an isolated, allowed measurement core.
//! 4. System-wide resource lock, held from the first warmup trial until
//!    aggregation is done and released on every exit path.
//! 5. Warmup and measured trials, then aggregation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use joulegate_core::calibration::{self, CalibrationProfile, DEFAULT_CALIBRATION_PATH};
use joulegate_core::energy::{Baseline, EnergyCounters, EnergySampler};
use joulegate_core::error::{CoreError, MeasurementError};
use joulegate_core::isolation::IsolationManager;
use joulegate_core::lock::{LockHandle, ResourceLock, DEFAULT_ACQUIRE_TIMEOUT};
use joulegate_core::metrics::{AggregatedEnergyMetrics, AggregationContext, MeasurementEnvironment};
use joulegate_core::policy::TrialPolicy;
use joulegate_core::request::MeasurementRequest;
use joulegate_core::sandbox::CandidateRunner;
use joulegate_core::task::{MeasurementTask, Phase, TaskOutcome, TaskProgress};
use joulegate_core::types::TaskId;
use joulegate_core::validator::CorrectnessValidator;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{TrialContext, TrialOrchestrator};
use crate::registry::TaskRegistry;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lease owner identity.
    pub worker_id: String,
    pub calibration_path: PathBuf,
    /// How long to wait for the resource lock before `lock_busy`.
    pub lock_wait: Duration,
    pub policy: TrialPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            calibration_path: PathBuf::from(DEFAULT_CALIBRATION_PATH),
            lock_wait: DEFAULT_ACQUIRE_TIMEOUT,
            policy: TrialPolicy::default(),
        }
    }
}

pub struct MeasurementPipeline<R> {
    config: PipelineConfig,
    runner: Arc<R>,
    validator: CorrectnessValidator<R>,
    counters: Arc<dyn EnergyCounters>,
    isolation: IsolationManager,
    lock: ResourceLock,
    registry: Arc<TaskRegistry>,
}

impl<R: CandidateRunner> MeasurementPipeline<R> {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<R>,
        counters: Arc<dyn EnergyCounters>,
        isolation: IsolationManager,
        lock: ResourceLock,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            validator: CorrectnessValidator::new(Arc::clone(&runner)),
            runner,
            counters,
            isolation,
            lock,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Queue `request` and run it to completion.
    pub async fn submit_and_run(
        &self,
        request: &MeasurementRequest,
        cancel: CancellationToken,
    ) -> Result<MeasurementTask, CoreError> {
        let task_id = self.registry.submit(request);
        self.run(task_id, request, cancel).await
    }

    /// Drive a queued task to a terminal state and return the final record.
    ///
    /// Measurement failures end up in the record as `failed` with an error
    /// code. `Err` is reserved for registry problems such as an unknown task
    /// or one that already ran.
    pub async fn run(
        &self,
        task_id: TaskId,
        request: &MeasurementRequest,
        cancel: CancellationToken,
    ) -> Result<MeasurementTask, CoreError> {
        if let Err(e) = request.validate_request() {
            let err = MeasurementError::from(e);
            tracing::warn!(task_id = %task_id, error = %err, "Request rejected");
            return self.registry.finish(task_id, failed(&err, None));
        }

        self.registry.start(task_id)?;
        tracing::info!(
            task_id = %task_id,
            test_cases = request.test_cases.len(),
            trials = request.energy_measurement_trials,
            warmup = request.warmup_trials,
            "Measurement task started",
        );

        self.report(task_id, Phase::Validating, 1, 1);
        let validation = self.validator.validate(request).await;
        if !validation.is_correct {
            let err = MeasurementError::ValidationFailed {
                summary: validation.summary(),
            };
            return self
                .registry
                .finish(task_id, failed(&err, Some(validation)));
        }

        let outcome = match self.measure(task_id, request, &cancel).await {
            Ok(metrics) => {
                tracing::info!(
                    task_id = %task_id,
                    median_total_joules = metrics.median_total_energy_joules,
                    trials = metrics.trial_count_used,
                    converged = metrics.converged,
                    confidence = metrics.confidence.as_str(),
                    "Energy measurement finished",
                );
                TaskOutcome::Completed {
                    validation,
                    metrics,
                }
            }
            Err(e) => {
                tracing::error!(
                    task_id = %task_id,
                    error_type = %e.error_type(),
                    error = %e,
                    "Energy measurement aborted",
                );
                failed(&e, Some(validation))
            }
        };
        self.registry.finish(task_id, outcome)
    }

    /// Preconditions, lock, trials, aggregation.
    async fn measure(
        &self,
        task_id: TaskId,
        request: &MeasurementRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregatedEnergyMetrics, MeasurementError> {
        if cancel.is_cancelled() {
            return Err(MeasurementError::Cancelled { completed_trials: 0 });
        }

        let profile = calibration::load_fresh(&self.config.calibration_path, Utc::now())
            .inspect_err(|e| tracing::warn!(error = %e, "Calibration profile rejected"))?;
        self.isolation.verify_core(profile.measurement_core)?;

        self.report(task_id, Phase::AcquiringLock, 1, 1);
        let mut handle = self
            .lock
            .acquire(&self.config.worker_id, self.config.lock_wait)
            .await?;

        let result = self
            .measure_locked(task_id, request, &profile, &mut handle, cancel)
            .await;

        if let Err(e) = self.lock.release(handle).await {
            tracing::error!(
                task_id = %task_id,
                resource = %self.lock.resource(),
                error = %e,
                "Failed to release resource lock",
            );
        }
        result
    }

    async fn measure_locked(
        &self,
        task_id: TaskId,
        request: &MeasurementRequest,
        profile: &CalibrationProfile,
        handle: &mut LockHandle,
        cancel: &CancellationToken,
    ) -> Result<AggregatedEnergyMetrics, MeasurementError> {
        // Counters that cannot be read at all are a sampler fault, not a
        // string of failed trials.
        self.counters.read()?;

        let policy = &self.config.policy;
        let baseline = Baseline {
            package_idle_watts: profile.package_idle_watts,
            dram_idle_watts: profile.dram_idle_watts.filter(|_| policy.dram_baseline),
        };
        let sampler = EnergySampler::new(Arc::clone(&self.counters), baseline);
        let environment = MeasurementEnvironment {
            measurement_core: profile.measurement_core,
            package_domain: sampler.package_domain(),
            dram_available: sampler.dram_available(),
            dram_baseline_applied: sampler.dram_available() && baseline.dram_idle_watts.is_some(),
            package_idle_watts: profile.package_idle_watts,
            calibration_generated_at: profile.generated_at,
            cpu_temperature_celsius: self.isolation.cpu_temperature_celsius(),
        };

        let orchestrator =
            TrialOrchestrator::new(Arc::clone(&self.runner), sampler, policy.clone());
        let on_progress = |progress: TaskProgress| {
            if let Err(e) = self.registry.update_progress(task_id, progress) {
                tracing::warn!(task_id = %task_id, error = %e, "Progress update rejected");
            }
        };
        let ctx = TrialContext {
            request,
            core: profile.measurement_core,
            lock: &self.lock,
            cancel,
        };
        let run = orchestrator.run(ctx, handle, &on_progress).await?;

        self.report(task_id, Phase::Aggregating, 1, 1);
        AggregatedEnergyMetrics::aggregate(
            run.records,
            AggregationContext {
                test_case_count: request.test_cases.len(),
                converged: run.converged,
                failed_trials: run.failed_trials,
                min_samples: policy.effective_min_samples(),
                environment,
            },
        )
        .ok_or_else(|| MeasurementError::Internal("no accepted trials to aggregate".into()))
    }

    fn report(&self, task_id: TaskId, phase: Phase, current: u32, total: u32) {
        let progress = TaskProgress {
            phase,
            current,
            total,
        };
        if let Err(e) = self.registry.update_progress(task_id, progress) {
            tracing::warn!(task_id = %task_id, error = %e, "Progress update rejected");
        }
    }
}

fn failed(
    err: &MeasurementError,
    validation: Option<joulegate_core::validation::ValidationOutcome>,
) -> TaskOutcome {
    TaskOutcome::Failed {
        error_type: err.error_type(),
        message: err.to_string(),
        validation,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
