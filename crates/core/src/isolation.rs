//! CPU isolation: isolated-core discovery, affinity pinning and readiness
//! preconditions.
//!
//! Pinning never falls back to unpinned execution. Any failure to bind a
//! process to the measurement core is an [`IsolationError`] and aborts the
//! measurement.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationError, CalibrationProfile};
use crate::lock::ResourceLock;
use crate::types::CpuId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_CPU_SYSFS_ROOT: &str = "/sys/devices/system/cpu";
pub const DEFAULT_THERMAL_ROOT: &str = "/sys/class/thermal";

/// Thermal zone types that report CPU die temperatures.
const CPU_THERMAL_KEYWORDS: &[&str] = &["cpu", "core", "pkg", "x86"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("No isolated CPU cores configured on this host")]
    NoIsolatedCores,

    #[error("Measurement core {core} is not isolated (isolated: {isolated})")]
    CoreNotIsolated { core: CpuId, isolated: String },

    #[error("Measurement core {core} is outside this process's allowed CPU set")]
    CoreNotAllowed { core: CpuId },

    #[error("Failed to set CPU affinity of pid {pid} to core {core}: {source}")]
    Affinity {
        pid: u32,
        core: CpuId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CPU list {0:?}")]
    InvalidCpuList(String),

    #[error("CPU affinity is not supported on this platform")]
    Unsupported,

    #[error("Host is not ready to measure: {0}")]
    NotReady(String),
}

// ---------------------------------------------------------------------------
// CPU lists and affinity
// ---------------------------------------------------------------------------

/// Parse a kernel CPU list such as `"0-2,4,7-8"`. Empty input is an empty set.
pub fn parse_cpu_list(raw: &str) -> Result<BTreeSet<CpuId>, IsolationError> {
    let invalid = || IsolationError::InvalidCpuList(raw.to_string());
    let mut cpus = BTreeSet::new();

    for part in raw.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: CpuId = lo.trim().parse().map_err(|_| invalid())?;
                let hi: CpuId = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => {
                cpus.insert(part.parse().map_err(|_| invalid())?);
            }
        }
    }

    Ok(cpus)
}

fn format_cpu_set(cpus: &BTreeSet<CpuId>) -> String {
    cpus.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Bind `pid` to exactly `core`.
#[cfg(target_os = "linux")]
pub fn pin(pid: u32, core: CpuId) -> Result<(), IsolationError> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(IsolationError::CoreNotAllowed { core });
    }
    // SAFETY: `cpu_set_t` is plain data and all-zero is the empty set. The
    // pointer passed to `sched_setaffinity` is valid for `size_of` bytes.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(
            pid as libc::pid_t,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };
    if rc != 0 {
        return Err(IsolationError::Affinity {
            pid,
            core,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin(_pid: u32, _core: CpuId) -> Result<(), IsolationError> {
    Err(IsolationError::Unsupported)
}

/// CPUs `pid` may currently run on.
#[cfg(target_os = "linux")]
pub fn allowed_cpus(pid: u32) -> Result<BTreeSet<CpuId>, IsolationError> {
    // SAFETY: as in `pin`; the kernel fills `set` on success.
    let (rc, set) = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        let rc = libc::sched_getaffinity(
            pid as libc::pid_t,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut set,
        );
        (rc, set)
    };
    if rc != 0 {
        return Err(IsolationError::Sysfs {
            path: PathBuf::from(format!("/proc/{pid}/status")),
            source: std::io::Error::last_os_error(),
        });
    }
    let cpus = (0..libc::CPU_SETSIZE as usize)
        // SAFETY: index is below CPU_SETSIZE.
        .filter(|cpu| unsafe { libc::CPU_ISSET(*cpu, &set) })
        .collect();
    Ok(cpus)
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus(_pid: u32) -> Result<BTreeSet<CpuId>, IsolationError> {
    Err(IsolationError::Unsupported)
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

/// Outcome of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub ok: bool,
    pub detail: String,
}

impl CheckStatus {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Result of [`IsolationManager::verify_preconditions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionReport {
    pub calibration: CheckStatus,
    pub isolated_cores: CheckStatus,
    pub lock: CheckStatus,
}

impl PreconditionReport {
    pub fn is_ready(&self) -> bool {
        self.calibration.ok && self.isolated_cores.ok && self.lock.ok
    }

    /// Names and details of every failing check.
    pub fn failures(&self) -> Vec<String> {
        [
            ("calibration", &self.calibration),
            ("isolated_cores", &self.isolated_cores),
            ("lock", &self.lock),
        ]
        .into_iter()
        .filter(|(_, status)| !status.ok)
        .map(|(name, status)| format!("{name}: {}", status.detail))
        .collect()
    }

    /// Turn a failing report into an error listing every failed check.
    pub fn ensure_ready(&self) -> Result<(), IsolationError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(IsolationError::NotReady(self.failures().join("; ")))
        }
    }
}

/// Host isolation state rooted at configurable sysfs paths.
#[derive(Debug, Clone)]
pub struct IsolationManager {
    cpu_sysfs_root: PathBuf,
    thermal_root: PathBuf,
}

impl Default for IsolationManager {
    fn default() -> Self {
        Self::new(DEFAULT_CPU_SYSFS_ROOT, DEFAULT_THERMAL_ROOT)
    }
}

impl IsolationManager {
    pub fn new(cpu_sysfs_root: impl Into<PathBuf>, thermal_root: impl Into<PathBuf>) -> Self {
        Self {
            cpu_sysfs_root: cpu_sysfs_root.into(),
            thermal_root: thermal_root.into(),
        }
    }

    /// Cores removed from the general scheduler (`isolcpus=`).
    pub fn isolated_cpus(&self) -> Result<BTreeSet<CpuId>, IsolationError> {
        let path = self.cpu_sysfs_root.join("isolated");
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| IsolationError::Sysfs { path, source })?;
        parse_cpu_list(&raw)
    }

    /// Check that `core` is isolated and that this process may run on it.
    pub fn verify_core(&self, core: CpuId) -> Result<(), IsolationError> {
        let isolated = self.isolated_cpus()?;
        if isolated.is_empty() {
            return Err(IsolationError::NoIsolatedCores);
        }
        if !isolated.contains(&core) {
            return Err(IsolationError::CoreNotIsolated {
                core,
                isolated: format_cpu_set(&isolated),
            });
        }
        let allowed = allowed_cpus(std::process::id())?;
        if !allowed.contains(&core) {
            return Err(IsolationError::CoreNotAllowed { core });
        }
        Ok(())
    }

    /// Pin `pid` to `core`.
    pub fn pin(&self, pid: u32, core: CpuId) -> Result<(), IsolationError> {
        pin(pid, core)?;
        tracing::debug!(pid, core, "Pinned process to measurement core");
        Ok(())
    }

    /// Evaluate every readiness precondition without short-circuiting.
    pub async fn verify_preconditions(
        &self,
        calibration: &Result<CalibrationProfile, CalibrationError>,
        lock: &ResourceLock,
    ) -> PreconditionReport {
        let calibration_status = match calibration {
            Ok(profile) => CheckStatus::ok(format!(
                "generated at {}, core {}",
                profile.generated_at.to_rfc3339(),
                profile.measurement_core
            )),
            Err(e) => CheckStatus::failed(e.to_string()),
        };

        let cores_status = match calibration {
            Ok(profile) => match self.verify_core(profile.measurement_core) {
                Ok(()) => CheckStatus::ok(format!(
                    "core {} isolated",
                    profile.measurement_core
                )),
                Err(e) => CheckStatus::failed(e.to_string()),
            },
            Err(_) => match self.isolated_cpus() {
                Ok(set) if !set.is_empty() => CheckStatus::failed(format!(
                    "isolated cores {} present, measurement core unknown",
                    format_cpu_set(&set)
                )),
                Ok(_) => CheckStatus::failed(IsolationError::NoIsolatedCores.to_string()),
                Err(e) => CheckStatus::failed(e.to_string()),
            },
        };

        let lock_status = match lock.ping().await {
            Ok(()) => CheckStatus::ok(format!("resource {} reachable", lock.resource())),
            Err(e) => CheckStatus::failed(e.to_string()),
        };

        PreconditionReport {
            calibration: calibration_status,
            isolated_cores: cores_status,
            lock: lock_status,
        }
    }

    /// Hottest CPU thermal zone in degrees Celsius, if any can be read.
    pub fn cpu_temperature_celsius(&self) -> Option<f64> {
        let entries = std::fs::read_dir(&self.thermal_root).ok()?;
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
            .filter_map(|e| read_cpu_zone_celsius(&e.path()))
            .reduce(f64::max)
    }
}

fn read_cpu_zone_celsius(zone: &Path) -> Option<f64> {
    let kind = std::fs::read_to_string(zone.join("type")).ok()?.to_lowercase();
    if !CPU_THERMAL_KEYWORDS.iter().any(|k| kind.contains(k)) {
        return None;
    }
    let millis: f64 = std::fs::read_to_string(zone.join("temp"))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(millis / 1000.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::lock::MemoryLeaseStore;

    fn sysfs_with_isolated(list: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("isolated"), format!("{list}\n")).unwrap();
        tmp
    }

    fn profile(core: CpuId) -> CalibrationProfile {
        CalibrationProfile {
            version: 1,
            measurement_core: core,
            socket_id: 0,
            package_idle_watts: 10.0,
            dram_idle_watts: None,
            generated_at: Utc::now(),
            max_age_days: None,
            cv_percent: None,
        }
    }

    fn memory_lock() -> ResourceLock {
        ResourceLock::new(
            Arc::new(MemoryLeaseStore::new()),
            "socket0",
            Duration::from_secs(30),
        )
    }

    #[test]
    fn parses_ranges_and_singles() {
        let cpus = parse_cpu_list("0-2,4,7-8\n").unwrap();
        assert_eq!(cpus.into_iter().collect::<Vec<_>>(), vec![0, 1, 2, 4, 7, 8]);
    }

    #[test]
    fn empty_list_is_empty_set() {
        assert!(parse_cpu_list("\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_malformed_lists() {
        assert_matches!(parse_cpu_list("a-b"), Err(IsolationError::InvalidCpuList(_)));
        assert_matches!(parse_cpu_list("5-2"), Err(IsolationError::InvalidCpuList(_)));
    }

    #[test]
    fn no_isolated_cores_is_refused() {
        let tmp = sysfs_with_isolated("");
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        assert_matches!(manager.verify_core(0), Err(IsolationError::NoIsolatedCores));
    }

    #[test]
    fn core_outside_isolated_set_is_refused() {
        let tmp = sysfs_with_isolated("2-3");
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        assert_matches!(
            manager.verify_core(5),
            Err(IsolationError::CoreNotIsolated { core: 5, .. })
        );
    }

    #[test]
    fn missing_sysfs_file_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        assert_matches!(manager.isolated_cpus(), Err(IsolationError::Sysfs { .. }));
    }

    #[tokio::test]
    async fn preconditions_report_every_failure() {
        let tmp = sysfs_with_isolated("");
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        let calibration = Err(CalibrationError::Missing {
            path: PathBuf::from("/nope"),
        });

        let report = manager
            .verify_preconditions(&calibration, &memory_lock())
            .await;
        assert!(!report.is_ready());
        assert!(!report.calibration.ok);
        assert!(!report.isolated_cores.ok);
        assert!(report.lock.ok);
        assert_eq!(report.failures().len(), 2);
        assert_matches!(
            report.ensure_ready(),
            Err(IsolationError::NotReady(msg)) if msg.starts_with("calibration:")
        );
    }

    #[tokio::test]
    async fn preconditions_flag_non_isolated_core() {
        let tmp = sysfs_with_isolated("2");
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        let report = manager
            .verify_preconditions(&Ok(profile(3)), &memory_lock())
            .await;
        assert!(report.calibration.ok);
        assert!(!report.isolated_cores.ok);
        assert!(report.isolated_cores.detail.contains("not isolated"));
    }

    #[test]
    fn temperature_uses_hottest_cpu_zone() {
        let tmp = tempfile::tempdir().unwrap();
        for (zone, kind, temp) in [
            ("thermal_zone0", "acpitz", "90000"),
            ("thermal_zone1", "x86_pkg_temp", "55000"),
            ("thermal_zone2", "cpu-core", "61500"),
        ] {
            let dir = tmp.path().join(zone);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
            std::fs::write(dir.join("temp"), format!("{temp}\n")).unwrap();
        }
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        assert_eq!(manager.cpu_temperature_celsius(), Some(61.5));
    }

    #[test]
    fn temperature_absent_without_cpu_zones() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = IsolationManager::new(tmp.path(), tmp.path());
        assert_eq!(manager.cpu_temperature_celsius(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pins_child_to_single_core() {
        let allowed = allowed_cpus(std::process::id()).unwrap();
        let core = *allowed.iter().next().unwrap();

        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        pin(child.id(), core).unwrap();
        let child_set = allowed_cpus(child.id()).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(child_set.into_iter().collect::<Vec<_>>(), vec![core]);
    }
}
