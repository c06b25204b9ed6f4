//! Host system sampling via `sysinfo`.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use corelink_core::{
    SampleKind, SamplePayload, SampleSnapshot, SystemStats,
    snapshot::{CpuStats, DiskStats, MemoryStats, bytes_to_gb, round1},
    traits::{SampleError, SampleSource},
};
use sysinfo::{Disks, System};

use crate::error::CollectorError;

/// Host hostname file mounted into the container, preferred over the
/// container's own hostname.
pub const HOST_HOSTNAME_PATH: &str = "/etc/host_hostname";

/// System sample source.
#[derive(Debug)]
pub struct SystemSampler {
    sys: Mutex<System>,
    hostname_file: PathBuf,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
            hostname_file: PathBuf::from(HOST_HOSTNAME_PATH),
        }
    }

    /// Read the hostname from `path` instead of the default file.
    #[must_use]
    pub fn with_hostname_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostname_file = path.into();
        self
    }

    /// Take one reading.
    ///
    /// # Errors
    /// Returns error if the sampler's lock is poisoned.
    pub async fn stats(&self) -> Result<SystemStats, CollectorError> {
        let hostname = read_hostname(&self.hostname_file)
            .await
            .or_else(System::host_name)
            .unwrap_or_default();

        let (cpu, memory) = {
            let mut sys = self
                .sys
                .lock()
                .map_err(|e| CollectorError::Poisoned(e.to_string()))?;
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            (cpu_stats(&sys), memory_stats(&sys))
        };

        let stats = SystemStats {
            hostname,
            os: os_label(),
            uptime_seconds: System::uptime(),
            cpu,
            memory,
            disk: disk_stats(&Disks::new_with_refreshed_list()),
        };
        tracing::trace!(
            cpu = stats.cpu.percent,
            memory = stats.memory.percent,
            disk = stats.disk.percent,
            "System sample"
        );
        Ok(stats)
    }
}

async fn read_hostname(path: &Path) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let name = contents.trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn os_label() -> String {
    let family = match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    };
    match System::kernel_version() {
        Some(release) => format!("{family} {release}"),
        None => family.to_string(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round1(part as f64 / total as f64 * 100.0)
    }
}

fn cpu_stats(sys: &System) -> CpuStats {
    CpuStats {
        count_logical: sys.cpus().len(),
        percent: sys.global_cpu_usage(),
        freq_mhz: sys.cpus().first().map(sysinfo::Cpu::frequency).filter(|f| *f > 0),
    }
}

fn memory_stats(sys: &System) -> MemoryStats {
    let total = sys.total_memory();
    let available = sys.available_memory();
    MemoryStats {
        total_gb: bytes_to_gb(total),
        used_gb: bytes_to_gb(sys.used_memory()),
        available_gb: bytes_to_gb(available),
        percent: percent(total.saturating_sub(available), total),
    }
}

/// Usage of the root filesystem, or the largest disk when `/` is not listed.
fn disk_stats(disks: &Disks) -> DiskStats {
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()));

    let (total, free) = root.map_or((0, 0), |d| (d.total_space(), d.available_space()));
    let used = total.saturating_sub(free);
    DiskStats {
        total_gb: bytes_to_gb(total),
        used_gb: bytes_to_gb(used),
        free_gb: bytes_to_gb(free),
        percent: percent(used, total),
    }
}

#[async_trait]
impl SampleSource for SystemSampler {
    fn kind(&self) -> SampleKind {
        SampleKind::System
    }

    async fn gather(&self) -> Result<SampleSnapshot, SampleError> {
        let stats = self.stats().await?;
        Ok(SampleSnapshot::now(SamplePayload::System(Box::new(stats))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert!((percent(1, 4) - 25.0).abs() < f64::EPSILON);
        assert!((percent(1, 3) - 33.3).abs() < 1e-9);
        assert!(percent(5, 0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_hostname_file_is_preferred() {
        let path = std::env::temp_dir().join(format!("corelink-hostname-{}", std::process::id()));
        tokio::fs::write(&path, "gpu-node-7\n").await.unwrap();

        let sampler = SystemSampler::new().with_hostname_file(&path);
        let stats = sampler.stats().await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(stats.hostname, "gpu-node-7");
    }

    #[tokio::test]
    async fn test_gather_produces_system_snapshot() {
        let sampler = SystemSampler::new().with_hostname_file("/nonexistent/hostname");
        let snapshot = tokio_test::assert_ok!(sampler.gather().await);
        let SamplePayload::System(stats) = snapshot.payload() else {
            panic!("expected system payload");
        };
        assert!(stats.cpu.count_logical > 0);
        assert!((0.0..=100.0).contains(&stats.memory.percent));
        assert!(stats.memory.total_gb >= stats.memory.available_gb);
        assert!(!stats.os.is_empty());
    }
}
