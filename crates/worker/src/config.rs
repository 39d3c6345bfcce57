use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use joulegate_core::calibration::DEFAULT_CALIBRATION_PATH;
use joulegate_core::energy::DEFAULT_RAPL_ROOT;
use joulegate_core::isolation::{DEFAULT_CPU_SYSFS_ROOT, DEFAULT_THERMAL_ROOT};
use joulegate_core::policy::{
    TrialPolicy, DEFAULT_MAX_TRIAL_RETRIES, DEFAULT_MIN_TRIAL_SECONDS, DEFAULT_TARGET_CV,
};
use joulegate_core::sandbox::DEFAULT_PYTHON_BIN;
use joulegate_pipeline::PipelineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid trial policy: {0}")]
    Policy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub calibration_path: PathBuf,
    /// Postgres lease store. Without it the lock only spans this process.
    pub database_url: Option<String>,
    pub worker_id: String,
    pub python_bin: String,
    pub rapl_root: PathBuf,
    pub rapl_socket: u32,
    pub cpu_sysfs_root: PathBuf,
    pub thermal_root: PathBuf,
    pub lock_lease: Duration,
    pub lock_wait: Duration,
    pub policy: TrialPolicy,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var             | Default                    |
    /// |---------------------|----------------------------|
    /// | `CALIBRATION_PATH`  | `config/calibration.json`  |
    /// | `DATABASE_URL`      | unset (in-process lock)    |
    /// | `WORKER_ID`         | `<hostname>-<pid>`         |
    /// | `PYTHON_BIN`        | `python3`                  |
    /// | `RAPL_ROOT`         | `/sys/class/powercap`      |
    /// | `RAPL_SOCKET`       | `0`                        |
    /// | `CPU_SYSFS_ROOT`    | `/sys/devices/system/cpu`  |
    /// | `THERMAL_ROOT`      | `/sys/class/thermal`       |
    /// | `LOCK_LEASE_SECS`   | `300`                      |
    /// | `LOCK_WAIT_SECS`    | `60`                       |
    /// | `TARGET_CV`         | `0.05`                     |
    /// | `MIN_TRIAL_SECONDS` | `0.2`                      |
    /// | `TRIAL_COOLDOWN_MS` | `500`                      |
    /// | `MAX_TRIAL_RETRIES` | `2`                        |
    /// | `DRAM_BASELINE`     | `false`                    |
    /// | `LOG_FORMAT`        | `text`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let worker_id = var("WORKER_ID").unwrap_or_else(|| {
            let host = var("HOSTNAME").unwrap_or_else(|| "localhost".into());
            format!("{host}-{}", std::process::id())
        });

        let policy = TrialPolicy {
            target_cv: parse(&var, "TARGET_CV", DEFAULT_TARGET_CV)?,
            min_trial_seconds: parse(&var, "MIN_TRIAL_SECONDS", DEFAULT_MIN_TRIAL_SECONDS)?,
            cooldown: Duration::from_millis(parse(&var, "TRIAL_COOLDOWN_MS", 500u64)?),
            max_retries_per_trial: parse(&var, "MAX_TRIAL_RETRIES", DEFAULT_MAX_TRIAL_RETRIES)?,
            dram_baseline: parse_flag(&var, "DRAM_BASELINE")?,
            ..TrialPolicy::default()
        };
        policy
            .validate()
            .map_err(|e| ConfigError::Policy(e.to_string()))?;

        let log_format = match var("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    value: v,
                    reason: "expected text or json".into(),
                })
            }
        };

        Ok(Self {
            calibration_path: var("CALIBRATION_PATH")
                .unwrap_or_else(|| DEFAULT_CALIBRATION_PATH.into())
                .into(),
            database_url: var("DATABASE_URL"),
            worker_id,
            python_bin: var("PYTHON_BIN").unwrap_or_else(|| DEFAULT_PYTHON_BIN.into()),
            rapl_root: var("RAPL_ROOT")
                .unwrap_or_else(|| DEFAULT_RAPL_ROOT.into())
                .into(),
            rapl_socket: parse(&var, "RAPL_SOCKET", 0u32)?,
            cpu_sysfs_root: var("CPU_SYSFS_ROOT")
                .unwrap_or_else(|| DEFAULT_CPU_SYSFS_ROOT.into())
                .into(),
            thermal_root: var("THERMAL_ROOT")
                .unwrap_or_else(|| DEFAULT_THERMAL_ROOT.into())
                .into(),
            lock_lease: Duration::from_secs(parse(&var, "LOCK_LEASE_SECS", 300u64)?),
            lock_wait: Duration::from_secs(parse(&var, "LOCK_WAIT_SECS", 60u64)?),
            policy,
            log_format,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            worker_id: self.worker_id.clone(),
            calibration_path: self.calibration_path.clone(),
            lock_wait: self.lock_wait,
            policy: self.policy.clone(),
        }
    }
}

fn parse<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_flag(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<bool, ConfigError> {
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var: key,
                value: v,
                reason: "expected a boolean".into(),
            }),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
