//! Hardware energy counters and the trial-window sampler.
//!
//! Counters are cumulative microjoule registers exposed through the Linux
//! powercap interface (`/sys/class/powercap/intel-rapl:N/energy_uj`). They are
//! fixed width and wrap at `max_energy_range_uj`, so every delta is taken in
//! modular arithmetic.
//!
//! A missing DRAM domain is a valid configuration: DRAM energy is then zero.
//! A counter that exists but cannot be read is a [`SamplerError`].

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default powercap root.
pub const DEFAULT_RAPL_ROOT: &str = "/sys/class/powercap";

/// Wrap period assumed when `max_energy_range_uj` is unreadable (32-bit counter).
pub const FALLBACK_WRAP_UJ: u64 = 1 << 32;

const MICROJOULES_PER_JOULE: f64 = 1_000_000.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("No energy counter domain found: {0}")]
    NotFound(String),

    #[error("Failed to read energy counter {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed energy counter value in {path}: {value:?}")]
    Parse { path: PathBuf, value: String },
}

// ---------------------------------------------------------------------------
// Counter sources
// ---------------------------------------------------------------------------

/// One simultaneous reading of every available counter, in microjoules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub package_uj: u64,
    pub dram_uj: Option<u64>,
}

/// A source of cumulative energy counters.
pub trait EnergyCounters: Send + Sync {
    fn read(&self) -> Result<CounterSnapshot, SamplerError>;

    /// Value at which the package counter wraps back to zero.
    fn package_wrap_uj(&self) -> u64;

    /// Wrap period of the DRAM counter, `None` when the domain is absent.
    fn dram_wrap_uj(&self) -> Option<u64>;

    /// Human-readable name of the package domain (e.g. `package-0`).
    fn package_domain(&self) -> String;

    fn has_dram(&self) -> bool {
        self.dram_wrap_uj().is_some()
    }
}

#[derive(Debug, Clone)]
struct RaplZone {
    name: String,
    energy_path: PathBuf,
    wrap_uj: u64,
}

impl RaplZone {
    fn open(dir: &Path) -> Result<Self, SamplerError> {
        let name = read_trimmed(&dir.join("name"))?;
        let energy_path = dir.join("energy_uj");
        if !energy_path.exists() {
            return Err(SamplerError::NotFound(format!(
                "{} has no energy_uj",
                dir.display()
            )));
        }
        let wrap_uj = read_u64(&dir.join("max_energy_range_uj"))
            .ok()
            .filter(|v| *v > 0)
            .unwrap_or(FALLBACK_WRAP_UJ);
        Ok(Self {
            name,
            energy_path,
            wrap_uj,
        })
    }

    fn read_uj(&self) -> Result<u64, SamplerError> {
        read_u64(&self.energy_path)
    }
}

/// RAPL counters for one package and, when present, its DRAM sub-zone.
#[derive(Debug, Clone)]
pub struct RaplCounters {
    package: RaplZone,
    dram: Option<RaplZone>,
}

impl RaplCounters {
    /// Locate `intel-rapl:<socket>` under `root` and its `dram` sub-zone.
    ///
    /// The package zone must exist. The DRAM zone is optional.
    pub fn discover(root: &Path, socket: u32) -> Result<Self, SamplerError> {
        let package_dir = root.join(format!("intel-rapl:{socket}"));
        if !package_dir.is_dir() {
            return Err(SamplerError::NotFound(format!(
                "{} does not exist",
                package_dir.display()
            )));
        }
        let package = RaplZone::open(&package_dir)?;

        let prefix = format!("intel-rapl:{socket}:");
        let mut dram = None;
        let entries = std::fs::read_dir(&package_dir).map_err(|source| SamplerError::Read {
            path: package_dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }
            if let Ok(zone) = RaplZone::open(&entry.path()) {
                if zone.name == "dram" {
                    dram = Some(zone);
                    break;
                }
            }
        }

        tracing::info!(
            package = %package.name,
            package_wrap_uj = package.wrap_uj,
            dram = dram.is_some(),
            "Discovered RAPL energy counters",
        );

        Ok(Self { package, dram })
    }
}

impl EnergyCounters for RaplCounters {
    fn read(&self) -> Result<CounterSnapshot, SamplerError> {
        let package_uj = self.package.read_uj()?;
        let dram_uj = match &self.dram {
            Some(zone) => Some(zone.read_uj()?),
            None => None,
        };
        Ok(CounterSnapshot {
            package_uj,
            dram_uj,
        })
    }

    fn package_wrap_uj(&self) -> u64 {
        self.package.wrap_uj
    }

    fn dram_wrap_uj(&self) -> Option<u64> {
        self.dram.as_ref().map(|z| z.wrap_uj)
    }

    fn package_domain(&self) -> String {
        self.package.name.clone()
    }
}

/// Stand-in for a host whose counters could not be discovered. Every read
/// fails with the discovery error.
#[derive(Debug, Clone)]
pub struct UnavailableCounters {
    reason: String,
}

impl UnavailableCounters {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl EnergyCounters for UnavailableCounters {
    fn read(&self) -> Result<CounterSnapshot, SamplerError> {
        Err(SamplerError::NotFound(self.reason.clone()))
    }

    fn package_wrap_uj(&self) -> u64 {
        FALLBACK_WRAP_UJ
    }

    fn dram_wrap_uj(&self) -> Option<u64> {
        None
    }

    fn package_domain(&self) -> String {
        "unavailable".into()
    }
}

fn read_trimmed(path: &Path) -> Result<String, SamplerError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| SamplerError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn read_u64(path: &Path) -> Result<u64, SamplerError> {
    let raw = read_trimmed(path)?;
    raw.parse().map_err(|_| SamplerError::Parse {
        path: path.to_path_buf(),
        value: raw,
    })
}

/// Difference between two readings of a counter that wraps at `wrap_uj`.
pub fn counter_delta(before: u64, after: u64, wrap_uj: u64) -> u64 {
    if after >= before {
        after - before
    } else {
        wrap_uj.saturating_sub(before).saturating_add(after)
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Raw readings for one executed trial window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSample {
    pub package_joules_raw: f64,
    /// Zero when no DRAM domain exists.
    pub dram_joules_raw: f64,
    pub dram_available: bool,
    pub wall_seconds: f64,
    /// Complete passes over the workload inside the window (at least 1).
    pub repeat_count: u64,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

/// Idle power subtracted from raw counter deltas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub package_idle_watts: f64,
    /// Applied to DRAM only when set.
    pub dram_idle_watts: Option<f64>,
}

/// Baseline-corrected energy for one logical run of the workload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetEnergy {
    pub package_joules: f64,
    pub dram_joules: f64,
    pub seconds: f64,
}

impl NetEnergy {
    pub fn total_joules(&self) -> f64 {
        self.package_joules + self.dram_joules
    }
}

/// Failure of a sampled window: either the counters or the work itself.
#[derive(Debug, thiserror::Error)]
pub enum WindowError<E> {
    #[error(transparent)]
    Counters(SamplerError),

    #[error("{0}")]
    Work(E),
}

/// Reads counters around a unit of work and applies the idle baseline.
#[derive(Clone)]
pub struct EnergySampler {
    counters: Arc<dyn EnergyCounters>,
    baseline: Baseline,
}

impl EnergySampler {
    pub fn new(counters: Arc<dyn EnergyCounters>, baseline: Baseline) -> Self {
        Self { counters, baseline }
    }

    pub fn baseline(&self) -> Baseline {
        self.baseline
    }

    pub fn dram_available(&self) -> bool {
        self.counters.has_dram()
    }

    pub fn package_domain(&self) -> String {
        self.counters.package_domain()
    }

    /// Read counters, run `work`, read counters again.
    ///
    /// `work` resolves to the number of complete workload passes it executed.
    pub async fn sample_window<F, Fut, E>(&self, work: F) -> Result<TrialSample, WindowError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, E>>,
    {
        let started_at = Utc::now();
        let before = self.counters.read().map_err(WindowError::Counters)?;
        let start = Instant::now();

        let repeat_count = work().await.map_err(WindowError::Work)?;

        let wall_seconds = start.elapsed().as_secs_f64();
        let after = self.counters.read().map_err(WindowError::Counters)?;
        let finished_at = Utc::now();

        let package_uj = counter_delta(
            before.package_uj,
            after.package_uj,
            self.counters.package_wrap_uj(),
        );
        let dram_uj = match (before.dram_uj, after.dram_uj, self.counters.dram_wrap_uj()) {
            (Some(b), Some(a), Some(wrap)) => Some(counter_delta(b, a, wrap)),
            _ => None,
        };

        Ok(TrialSample {
            package_joules_raw: package_uj as f64 / MICROJOULES_PER_JOULE,
            dram_joules_raw: dram_uj.map_or(0.0, |uj| uj as f64 / MICROJOULES_PER_JOULE),
            dram_available: dram_uj.is_some(),
            wall_seconds,
            repeat_count: repeat_count.max(1),
            started_at,
            finished_at,
        })
    }

    /// Baseline-corrected energy normalised to one logical run.
    ///
    /// Package energy is clamped at zero after subtraction.
    pub fn net(&self, sample: &TrialSample) -> NetEnergy {
        let repeats = sample.repeat_count.max(1) as f64;
        let package = (sample.package_joules_raw
            - self.baseline.package_idle_watts * sample.wall_seconds)
            .max(0.0);
        let dram = match (sample.dram_available, self.baseline.dram_idle_watts) {
            (true, Some(idle)) => (sample.dram_joules_raw - idle * sample.wall_seconds).max(0.0),
            (true, None) => sample.dram_joules_raw,
            (false, _) => 0.0,
        };
        NetEnergy {
            package_joules: package / repeats,
            dram_joules: dram / repeats,
            seconds: sample.wall_seconds / repeats,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
