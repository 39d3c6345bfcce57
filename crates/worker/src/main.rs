use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use joulegate_core::energy::{EnergyCounters, RaplCounters, UnavailableCounters};
use joulegate_core::isolation::IsolationManager;
use joulegate_core::lock::{socket_resource, LeaseStore, MemoryLeaseStore, ResourceLock};
use joulegate_core::request::MeasurementRequest;
use joulegate_core::sandbox::PythonSandbox;
use joulegate_core::task::TaskState;
use joulegate_pipeline::{MeasurementPipeline, ReadinessProbe, TaskRegistry};
use joulegate_worker::config::{LogFormat, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: joulegate-worker <measure [REQUEST.json | -] | readiness>";

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "joulegate_worker=info,joulegate_pipeline=info,joulegate_core=info,joulegate_db=info".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
    tracing::info!(
        worker_id = %config.worker_id,
        calibration = %config.calibration_path.display(),
        socket = config.rapl_socket,
        "Loaded worker configuration",
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("measure") => measure(&config, args.get(1).map(String::as_str)).await,
        Some("readiness") => readiness(&config).await,
        _ => {
            eprintln!("{USAGE}");
            Ok(ExitCode::from(2))
        }
    }
}

/// Run one request and print the final task record as JSON.
async fn measure(config: &WorkerConfig, source: Option<&str>) -> anyhow::Result<ExitCode> {
    let raw = match source {
        None | Some("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read request from stdin")?;
            buf
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {path}"))?,
    };
    let request: MeasurementRequest =
        serde_json::from_str(&raw).context("Request is not a valid measurement request")?;

    let lock = build_lock(config).await?;
    let counters = discover_counters(config);
    let pipeline = MeasurementPipeline::new(
        config.pipeline_config(),
        Arc::new(PythonSandbox::new(&config.python_bin)),
        counters,
        isolation(config),
        lock,
        Arc::new(TaskRegistry::default()),
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let task = pipeline.submit_and_run(&request, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);

    Ok(match task.state {
        TaskState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Print the readiness report as JSON. Exit status reflects readiness.
async fn readiness(config: &WorkerConfig) -> anyhow::Result<ExitCode> {
    let lock = build_lock(config).await?;
    let probe = ReadinessProbe::new(&config.calibration_path, isolation(config), lock);
    let report = probe.check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn build_lock(config: &WorkerConfig) -> anyhow::Result<ResourceLock> {
    let store: Arc<dyn LeaseStore> = match &config.database_url {
        Some(url) => {
            let pool = joulegate_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connection pool created");

            joulegate_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database migrations applied");

            Arc::new(joulegate_db::PgLeaseStore::new(pool))
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, resource lock only excludes measurements in this process"
            );
            Arc::new(MemoryLeaseStore::new())
        }
    };
    Ok(ResourceLock::new(
        store,
        socket_resource(config.rapl_socket),
        config.lock_lease,
    ))
}

/// RAPL counters, or a source that reports why they are missing so the
/// task fails with a sampler error instead of the process exiting.
fn discover_counters(config: &WorkerConfig) -> Arc<dyn EnergyCounters> {
    match RaplCounters::discover(&config.rapl_root, config.rapl_socket) {
        Ok(counters) => Arc::new(counters),
        Err(e) => {
            tracing::error!(
                root = %config.rapl_root.display(),
                error = %e,
                "Energy counters unavailable",
            );
            Arc::new(UnavailableCounters::new(e.to_string()))
        }
    }
}

fn isolation(config: &WorkerConfig) -> IsolationManager {
    IsolationManager::new(&config.cpu_sysfs_root, &config.thermal_root)
}

/// Wait for SIGINT or SIGTERM. Cancellation takes effect between trials.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT, cancelling after the current trial");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, cancelling after the current trial");
        }
    }
}
