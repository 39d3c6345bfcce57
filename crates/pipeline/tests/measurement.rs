//! End-to-end pipeline scenarios with a fake candidate runner.
//!
//! The fake runner "burns" energy into a shared meter while a trial executes
//! and the fake counters read that meter, so every trial window sees exactly
//! the energy its execution burned.

#![cfg(target_os = "linux")]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use joulegate_core::energy::{CounterSnapshot, EnergyCounters, SamplerError};
use joulegate_core::error::ErrorType;
use joulegate_core::isolation::{allowed_cpus, IsolationManager};
use joulegate_core::lock::{LeaseStore, LockError, MemoryLeaseStore, ResourceLock};
use joulegate_core::policy::TrialPolicy;
use joulegate_core::request::{MeasurementRequest, TestCase};
use joulegate_core::sandbox::{
    CandidateRunner, HarnessReply, PreparedRun, RunJob, RunMode, SandboxError,
};
use joulegate_core::task::{MeasurementTask, TaskState};
use joulegate_core::validation::TestFailureKind;
use joulegate_pipeline::events::{EVENT_TASK_COMPLETED, EVENT_TASK_PROGRESS};
use joulegate_pipeline::{MeasurementPipeline, PipelineConfig, TaskRegistry};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const RESOURCE: &str = "measurement-socket-0";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Meter(Arc<AtomicU64>);

struct MeterCounters {
    meter: Meter,
    reads: AtomicUsize,
    /// Reads after this many fail.
    fail_after: Option<usize>,
}

impl MeterCounters {
    fn new(meter: Meter) -> Self {
        Self {
            meter,
            reads: AtomicUsize::new(0),
            fail_after: None,
        }
    }

    fn failing_after(mut self, reads: usize) -> Self {
        self.fail_after = Some(reads);
        self
    }
}

impl EnergyCounters for MeterCounters {
    fn read(&self) -> Result<CounterSnapshot, SamplerError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after.is_some_and(|limit| n > limit) {
            return Err(SamplerError::NotFound("energy counter vanished".into()));
        }
        let uj = self.meter.0.load(Ordering::SeqCst);
        // DRAM accrues a quarter of what the package does.
        Ok(CounterSnapshot {
            package_uj: uj,
            dram_uj: Some(uj / 4),
        })
    }

    fn package_wrap_uj(&self) -> u64 {
        u64::MAX
    }

    fn dram_wrap_uj(&self) -> Option<u64> {
        Some(u64::MAX)
    }

    fn package_domain(&self) -> String {
        "package-0".into()
    }
}

type Solver = fn(&[Value]) -> Value;

fn square(args: &[Value]) -> Value {
    let x = args[0].as_i64().unwrap_or_default();
    json!(x * x)
}

fn square_but_seven(args: &[Value]) -> Value {
    match args[0].as_i64() {
        Some(7) => json!(0),
        Some(x) => json!(x * x),
        None => Value::Null,
    }
}

struct FakeRunner {
    solve: Solver,
    meter: Meter,
    /// Micro-joules burned per trial execution, cycled.
    burns: Vec<u64>,
    /// Micro-joules burned while a trial child is reaped.
    teardown_burn: u64,
    delay: Duration,
    /// The first N trial executions raise instead of returning.
    failing_trials: usize,
    /// Trial executions overrun their deadline.
    hanging_trials: bool,
    trial_executions: AtomicUsize,
}

impl FakeRunner {
    fn new(solve: Solver, meter: Meter) -> Self {
        Self {
            solve,
            meter,
            burns: vec![4_000_000],
            teardown_burn: 0,
            delay: Duration::from_millis(10),
            failing_trials: 0,
            hanging_trials: false,
            trial_executions: AtomicUsize::new(0),
        }
    }

    fn trials_run(&self) -> usize {
        self.trial_executions.load(Ordering::SeqCst)
    }
}

struct FakePrepared {
    reply: Result<HarnessReply, u64>,
    meter: Meter,
    burn: u64,
    teardown_burn: u64,
    delay: Duration,
}

impl PreparedRun for FakePrepared {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn run_workload(&mut self) -> Result<HarnessReply, SandboxError> {
        tokio::time::sleep(self.delay).await;
        self.meter.0.fetch_add(self.burn, Ordering::SeqCst);
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(elapsed_ms) => Err(SandboxError::Timeout {
                elapsed_ms: *elapsed_ms,
            }),
        }
    }

    async fn finish(self) -> Result<(), SandboxError> {
        self.meter.0.fetch_add(self.teardown_burn, Ordering::SeqCst);
        Ok(())
    }
}

impl CandidateRunner for FakeRunner {
    type Prepared = FakePrepared;

    async fn prepare(&self, job: RunJob) -> Result<FakePrepared, SandboxError> {
        let idle = |reply| FakePrepared {
            reply: Ok(reply),
            meter: self.meter.clone(),
            burn: 0,
            teardown_burn: 0,
            delay: Duration::ZERO,
        };

        if job.mode == RunMode::Check {
            return Ok(idle(HarnessReply::Ok {
                outputs: None,
                repeat_count: 0,
                wall_seconds: 0.0,
            }));
        }

        let outputs: Vec<Value> = job.calls.iter().map(|args| (self.solve)(args)).collect();
        if job.return_outputs {
            return Ok(idle(HarnessReply::Ok {
                outputs: Some(outputs),
                repeat_count: 1,
                wall_seconds: 0.0,
            }));
        }

        // Trial execution: pinned, outputs discarded.
        assert!(job.pin_core.is_some(), "trial jobs must be pinned");
        let index = self.trial_executions.fetch_add(1, Ordering::SeqCst);
        let reply = if self.hanging_trials {
            // The real sandbox kills the child at the deadline.
            Err(job.timeout.as_millis() as u64)
        } else if index < self.failing_trials {
            Ok(HarnessReply::Exception {
                message: "RuntimeError: flaky".into(),
                call_index: Some(0),
            })
        } else {
            Ok(HarnessReply::Ok {
                outputs: None,
                repeat_count: 1,
                wall_seconds: self.delay.as_secs_f64(),
            })
        };
        Ok(FakePrepared {
            reply,
            meter: self.meter.clone(),
            burn: self.burns[index % self.burns.len()],
            teardown_burn: self.teardown_burn,
            delay: self.delay,
        })
    }
}

// ---------------------------------------------------------------------------
// Host fixture
// ---------------------------------------------------------------------------

struct Host {
    dir: TempDir,
    core: usize,
}

impl Host {
    /// Sysfs tree whose only isolated core is one this process may use.
    fn new() -> Self {
        let core = *allowed_cpus(std::process::id())
            .unwrap()
            .iter()
            .next()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("isolated"), format!("{core}\n")).unwrap();
        let host = Self { dir, core };
        host.write_calibration(Utc::now(), None);
        host
    }

    fn calibration_path(&self) -> PathBuf {
        self.dir.path().join("calibration.json")
    }

    fn write_calibration(&self, generated_at: chrono::DateTime<Utc>, dram_idle_watts: Option<f64>) {
        let mut profile = json!({
            "version": 1,
            "measurement_core": self.core,
            "socket_id": 0,
            "package_idle_watts": 0.001,
            "generated_at": generated_at.to_rfc3339(),
        });
        if let Some(watts) = dram_idle_watts {
            profile["dram_idle_watts"] = json!(watts);
        }
        std::fs::write(self.calibration_path(), profile.to_string()).unwrap();
    }

    fn isolation(&self) -> IsolationManager {
        IsolationManager::new(self.dir.path(), self.dir.path())
    }
}

fn fast_policy() -> TrialPolicy {
    TrialPolicy {
        min_trial_seconds: 0.0,
        cooldown: Duration::ZERO,
        ..TrialPolicy::default()
    }
}

fn lock_on(store: Arc<dyn LeaseStore>) -> ResourceLock {
    ResourceLock::new(store, RESOURCE, Duration::from_secs(30))
        .with_poll_interval(Duration::from_millis(5))
}

fn pipeline(
    host: &Host,
    runner: Arc<FakeRunner>,
    counters: MeterCounters,
    store: Arc<dyn LeaseStore>,
    policy: TrialPolicy,
) -> MeasurementPipeline<FakeRunner> {
    pipeline_with_lock(host, runner, counters, lock_on(store), policy)
}

fn pipeline_with_lock(
    host: &Host,
    runner: Arc<FakeRunner>,
    counters: MeterCounters,
    lock: ResourceLock,
    policy: TrialPolicy,
) -> MeasurementPipeline<FakeRunner> {
    let config = PipelineConfig {
        worker_id: "test-worker".into(),
        calibration_path: host.calibration_path(),
        lock_wait: Duration::from_secs(10),
        policy,
    };
    MeasurementPipeline::new(
        config,
        runner,
        Arc::new(counters),
        host.isolation(),
        lock,
        Arc::new(TaskRegistry::default()),
    )
}

fn square_request() -> MeasurementRequest {
    MeasurementRequest::new(
        "def solve(x):\n    return x * x\n",
        "solve",
        vec![
            TestCase::new("t1", vec![json!(2)], json!(4)),
            TestCase::new("t2", vec![json!(7)], json!(49)),
        ],
    )
    .with_trials(3, 1)
}

struct Setup {
    host: Host,
    runner: Arc<FakeRunner>,
    store: Arc<MemoryLeaseStore>,
    pipeline: MeasurementPipeline<FakeRunner>,
}

fn setup(solve: Solver, policy: TrialPolicy) -> Setup {
    setup_with(solve, policy, |runner| runner, |counters| counters)
}

fn setup_with(
    solve: Solver,
    policy: TrialPolicy,
    tweak_runner: impl FnOnce(FakeRunner) -> FakeRunner,
    tweak_counters: impl FnOnce(MeterCounters) -> MeterCounters,
) -> Setup {
    let host = Host::new();
    let meter = Meter::default();
    let runner = Arc::new(tweak_runner(FakeRunner::new(solve, meter.clone())));
    let store = Arc::new(MemoryLeaseStore::new());
    let pipeline = pipeline(
        &host,
        Arc::clone(&runner),
        tweak_counters(MeterCounters::new(meter)),
        store.clone(),
        policy,
    );
    Setup {
        host,
        runner,
        store,
        pipeline,
    }
}

async fn run(
    pipeline: &MeasurementPipeline<FakeRunner>,
    request: &MeasurementRequest,
) -> MeasurementTask {
    pipeline
        .submit_and_run(request, CancellationToken::new())
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn correct_square_completes_with_metrics() {
    let s = setup(square, fast_policy());
    let mut events = s.pipeline.registry().subscribe();

    let task = run(&s.pipeline, &square_request()).await;

    assert_eq!(task.state, TaskState::Completed, "{task:?}");
    let validation = task.validation.as_ref().unwrap();
    assert!(validation.is_correct);
    assert_eq!(validation.passed_count, 2);

    let m = task.energy_metrics.as_ref().unwrap();
    // Identical burns converge as soon as a CV can be computed.
    assert!(m.converged);
    assert_eq!(m.trial_count_used, 2);
    assert_eq!(m.failed_trials, 0);
    assert!((m.median_package_energy_joules - 4.0).abs() < 1e-3);
    assert_eq!(m.median_dram_energy_joules, 1.0);
    assert_eq!(
        m.median_total_energy_joules,
        m.median_package_energy_joules + m.median_dram_energy_joules
    );
    assert_eq!(m.energy_per_test_case_joules, m.median_total_energy_joules / 2.0);
    assert!(m.power_consumption_watts > 0.0);
    assert_eq!(m.environment.measurement_core, s.host.core);
    assert!(m.environment.dram_available);
    assert!(!m.environment.dram_baseline_applied);

    // One warmup plus two measured trials.
    assert_eq!(s.runner.trials_run(), 3);
    assert!(s.store.current(RESOURCE).is_none(), "lock must be released");

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event.event_type);
    }
    assert_eq!(last.as_deref(), Some(EVENT_TASK_COMPLETED));
}

#[tokio::test]
async fn wrong_answer_fails_validation_without_measuring() {
    let s = setup(square_but_seven, fast_policy());

    let task = run(&s.pipeline, &square_request()).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::ValidationFailed));
    assert!(task.energy_metrics.is_none());
    let validation = task.validation.as_ref().unwrap();
    assert_eq!(validation.passed_count, 1);
    assert_eq!(
        validation.tests[1].failure_kind(),
        Some(TestFailureKind::WrongAnswer)
    );
    assert_eq!(s.runner.trials_run(), 0);
    assert!(s.store.current(RESOURCE).is_none());
}

#[tokio::test]
async fn counter_failures_in_every_trial_fail_the_task() {
    // Only the pre-flight read succeeds.
    let s = setup_with(square, fast_policy(), |r| r, |c| c.failing_after(1));
    let request = square_request().with_trials(3, 0);

    let task = run(&s.pipeline, &request).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::AllTrialsFailed));
    assert!(task.energy_metrics.is_none());
    assert!(task.error_message.as_deref().unwrap().contains("vanished"));
    assert!(s.store.current(RESOURCE).is_none());
}

#[tokio::test]
async fn unreadable_counters_are_a_sampler_error() {
    let s = setup_with(square, fast_policy(), |r| r, |c| c.failing_after(0));

    let task = run(&s.pipeline, &square_request()).await;

    assert_eq!(task.error_type, Some(ErrorType::SamplerError));
    assert_eq!(s.runner.trials_run(), 0);
    assert!(s.store.current(RESOURCE).is_none());
}

#[tokio::test]
async fn failed_trial_is_retried_and_counted() {
    let s = setup_with(
        square,
        fast_policy(),
        |mut r| {
            r.failing_trials = 1;
            r
        },
        |c| c,
    );
    let request = square_request().with_trials(3, 0);

    let task = run(&s.pipeline, &request).await;

    assert_eq!(task.state, TaskState::Completed, "{task:?}");
    let m = task.energy_metrics.unwrap();
    assert_eq!(m.failed_trials, 1);
    assert_eq!(m.trial_count_used, 2);
}

#[tokio::test]
async fn noisy_trials_run_every_slot() {
    let s = setup_with(
        square,
        fast_policy(),
        |mut r| {
            r.burns = vec![4_000_000, 12_000_000];
            r
        },
        |c| c,
    );
    let request = square_request().with_trials(4, 0);

    let task = run(&s.pipeline, &request).await;

    let m = task.energy_metrics.unwrap();
    assert!(!m.converged);
    assert_eq!(m.trial_count_used, 4);
    assert!(m.coefficient_of_variation.unwrap() > 0.05);
    assert_eq!(m.trials.len(), 4);
}

#[tokio::test]
async fn dram_baseline_is_applied_when_enabled() {
    let policy = TrialPolicy {
        dram_baseline: true,
        ..fast_policy()
    };
    let s = setup(square, policy);
    s.host.write_calibration(Utc::now(), Some(0.5));

    let task = run(&s.pipeline, &square_request()).await;

    let m = task.energy_metrics.unwrap();
    assert!(m.environment.dram_baseline_applied);
    assert!(m.median_dram_energy_joules < 1.0);
}

#[tokio::test]
async fn stale_calibration_refuses_before_any_trial() {
    let s = setup(square, fast_policy());
    s.host
        .write_calibration(Utc::now() - chrono::Duration::days(30), None);

    let task = run(&s.pipeline, &square_request()).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::CalibrationStaleOrMissing));
    assert!(task.validation.unwrap().is_correct);
    assert_eq!(s.runner.trials_run(), 0);
}

#[tokio::test]
async fn missing_calibration_refuses() {
    let s = setup(square, fast_policy());
    std::fs::remove_file(s.host.calibration_path()).unwrap();

    let task = run(&s.pipeline, &square_request()).await;

    assert_eq!(task.error_type, Some(ErrorType::CalibrationStaleOrMissing));
}

#[tokio::test]
async fn held_lock_reports_busy() {
    let host = Host::new();
    let meter = Meter::default();
    let runner = Arc::new(FakeRunner::new(square, meter.clone()));
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let other = lock_on(Arc::clone(&store));
    let held = other.acquire("other-worker", Duration::ZERO).await.unwrap();

    let config = PipelineConfig {
        worker_id: "test-worker".into(),
        calibration_path: host.calibration_path(),
        lock_wait: Duration::from_millis(30),
        policy: fast_policy(),
    };
    let p = MeasurementPipeline::new(
        config,
        Arc::clone(&runner),
        Arc::new(MeterCounters::new(meter)),
        host.isolation(),
        lock_on(store),
        Arc::new(TaskRegistry::default()),
    );

    let task = run(&p, &square_request()).await;

    assert_eq!(task.error_type, Some(ErrorType::LockBusy));
    assert!(task.error_type.unwrap().is_retryable());
    assert!(task.validation.unwrap().is_correct);
    assert_eq!(runner.trials_run(), 0);
    other.release(held).await.unwrap();
}

#[tokio::test]
async fn invalid_request_never_runs() {
    let s = setup(square, fast_policy());
    let request = MeasurementRequest::new("def solve(x):\n    return x\n", "solve", vec![]);

    let task = run(&s.pipeline, &request).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::InvalidRequest));
    assert!(task.started_at.is_none());
    assert!(task.validation.is_none());
}

#[tokio::test]
async fn cancellation_between_trials_releases_lock() {
    let s = setup_with(
        square,
        fast_policy(),
        |mut r| {
            r.delay = Duration::from_millis(50);
            r
        },
        |c| c,
    );
    let request = square_request().with_trials(10, 0);
    let cancel = CancellationToken::new();

    let mut events = s.pipeline.registry().subscribe();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.event_type == EVENT_TASK_PROGRESS
                && event.payload["phase"] == json!("measuring")
            {
                trigger.cancel();
                break;
            }
        }
    });

    let task = s
        .pipeline
        .submit_and_run(&request, cancel)
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::Cancelled));
    assert!(s.runner.trials_run() < 10);
    assert!(s.store.current(RESOURCE).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_pipelines_never_overlap_windows() {
    let host = Host::new();
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());

    let build = || {
        let meter = Meter::default();
        let runner = Arc::new(FakeRunner::new(square, meter.clone()));
        pipeline(
            &host,
            runner,
            MeterCounters::new(meter),
            Arc::clone(&store),
            fast_policy(),
        )
    };
    let a = build();
    let b = build();
    let request = square_request().with_trials(3, 1);

    let (ta, tb) = tokio::join!(run(&a, &request), run(&b, &request));

    let wa = ta.energy_metrics.expect("first pipeline completes").trials;
    let wb = tb.energy_metrics.expect("second pipeline completes").trials;
    for x in &wa {
        for y in &wb {
            assert!(
                x.finished_at <= y.started_at || y.finished_at <= x.started_at,
                "trial windows overlap: {x:?} / {y:?}"
            );
        }
    }
}

#[tokio::test]
async fn child_teardown_stays_outside_the_window() {
    let s = setup_with(
        square,
        fast_policy(),
        |mut r| {
            r.teardown_burn = 50_000_000;
            r
        },
        |c| c,
    );

    let task = run(&s.pipeline, &square_request()).await;

    let m = task.energy_metrics.unwrap();
    assert!((m.median_package_energy_joules - 4.0).abs() < 1e-3, "{m:?}");
    assert_eq!(m.median_dram_energy_joules, 1.0);
}

#[tokio::test]
async fn trials_past_their_deadline_fail_with_timeout() {
    let policy = TrialPolicy {
        max_retries_per_trial: 1,
        ..fast_policy()
    };
    let s = setup_with(
        square,
        policy,
        |mut r| {
            r.hanging_trials = true;
            r
        },
        |c| c,
    );
    let request = square_request().with_trials(2, 0);

    let task = run(&s.pipeline, &request).await;

    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_type, Some(ErrorType::Timeout));
    assert!(task.validation.as_ref().unwrap().is_correct);
    assert!(task.energy_metrics.is_none());
    // Two slots, each tried once and retried once.
    assert_eq!(s.runner.trials_run(), 4);
    assert!(s.store.current(RESOURCE).is_none());
}

/// Resolves once the task reports its first measured trial.
fn when_measuring(pipeline: &MeasurementPipeline<FakeRunner>) -> oneshot::Receiver<()> {
    let mut events = pipeline.registry().subscribe();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.event_type == EVENT_TASK_PROGRESS
                && event.payload["phase"] == json!("measuring")
            {
                let _ = tx.send(());
                break;
            }
        }
    });
    rx
}

#[tokio::test]
async fn long_trial_keeps_its_lease() {
    let host = Host::new();
    let meter = Meter::default();
    let runner = Arc::new(FakeRunner {
        delay: Duration::from_millis(400),
        ..FakeRunner::new(square, meter.clone())
    });
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let short_lease = ResourceLock::new(Arc::clone(&store), RESOURCE, Duration::from_millis(100))
        .with_poll_interval(Duration::from_millis(5));
    let p = pipeline_with_lock(
        &host,
        Arc::clone(&runner),
        MeterCounters::new(meter),
        short_lease,
        fast_policy(),
    );
    let request = square_request().with_trials(1, 0);

    let measuring = when_measuring(&p);
    let other = lock_on(Arc::clone(&store));
    let contender = tokio::spawn(async move {
        measuring.await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        other.acquire("other-worker", Duration::ZERO).await.map(|_| ())
    });

    let task = run(&p, &request).await;

    assert_eq!(task.state, TaskState::Completed, "{task:?}");
    assert_matches!(contender.await.unwrap(), Err(LockError::Busy { .. }));
}

#[tokio::test]
async fn lease_taken_mid_trial_fails_with_lock_lost() {
    let host = Host::new();
    let meter = Meter::default();
    let runner = Arc::new(FakeRunner {
        delay: Duration::from_millis(400),
        ..FakeRunner::new(square, meter.clone())
    });
    let memory = Arc::new(MemoryLeaseStore::new());
    let store: Arc<dyn LeaseStore> = memory.clone();
    let short_lease = ResourceLock::new(Arc::clone(&store), RESOURCE, Duration::from_millis(150))
        .with_poll_interval(Duration::from_millis(5));
    let p = pipeline_with_lock(
        &host,
        Arc::clone(&runner),
        MeterCounters::new(meter),
        short_lease,
        fast_policy(),
    );
    let request = square_request().with_trials(1, 0);

    // Another worker reclaims the resource while the trial is running.
    let measuring = when_measuring(&p);
    let thief_store = memory.clone();
    let thief_lock = lock_on(Arc::clone(&store));
    let thief = tokio::spawn(async move {
        measuring.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = thief_store.current(RESOURCE).unwrap();
        thief_store.release(&current).await.unwrap();
        thief_lock
            .acquire("other-worker", Duration::from_millis(100))
            .await
            .unwrap()
    });

    let task = run(&p, &request).await;

    assert_eq!(task.state, TaskState::Failed, "{task:?}");
    assert_eq!(task.error_type, Some(ErrorType::LockLost));
    assert!(task.energy_metrics.is_none());

    // Releasing the lost handle must leave the new holder's lease intact.
    let held = thief.await.unwrap();
    assert_eq!(memory.current(RESOURCE).unwrap().owner, "other-worker");
    lock_on(store).release(held).await.unwrap();
}
