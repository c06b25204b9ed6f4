//! Periodic sample snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Frame;

/// Sample type a poll channel can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// GPU device stats.
    Gpu,
    /// Host CPU/memory/disk stats.
    System,
}

impl SampleKind {
    /// Stable name used in logs and routes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gpu => "gpu",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One GPU device reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub temperature_c: i32,
    pub gpu_utilization_pct: u32,
    pub memory_utilization_pct: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_free_mb: u64,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub fan_speed_pct: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub count_logical: usize,
    pub percent: f32,
    pub freq_mhz: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

/// Host system reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub hostname: String,
    pub os: String,
    pub uptime_seconds: u64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: DiskStats,
}

/// Sample body.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplePayload {
    Gpu(Vec<GpuDevice>),
    System(Box<SystemStats>),
}

/// Timestamped, immutable sample broadcast to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSnapshot {
    taken_at: DateTime<Utc>,
    payload: SamplePayload,
}

impl SampleSnapshot {
    /// Snapshot taken now.
    #[must_use]
    pub fn now(payload: SamplePayload) -> Self {
        Self {
            taken_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    #[must_use]
    pub const fn payload(&self) -> &SamplePayload {
        &self.payload
    }

    /// Sample type of the payload.
    #[must_use]
    pub const fn kind(&self) -> SampleKind {
        match self.payload {
            SamplePayload::Gpu(_) => SampleKind::Gpu,
            SamplePayload::System(_) => SampleKind::System,
        }
    }

    /// Frame pushed to subscribed channels.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        match &self.payload {
            SamplePayload::Gpu(devices) => Frame::GpuStats {
                data: devices.clone(),
            },
            SamplePayload::System(stats) => Frame::SystemStats {
                data: (**stats).clone(),
            },
        }
    }
}

/// Round to one decimal place, as reported on the dashboard.
#[must_use]
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Bytes to gigabytes rounded to one decimal.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_gb(bytes: u64) -> f64 {
    round1(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_snapshot_frame() {
        let snap = SampleSnapshot::now(SamplePayload::Gpu(vec![]));
        assert_eq!(snap.kind(), SampleKind::Gpu);
        assert_eq!(snap.to_frame(), Frame::GpuStats { data: vec![] });
    }

    #[test]
    fn test_bytes_to_gb_rounds() {
        assert!((bytes_to_gb(1024 * 1024 * 1024) - 1.0).abs() < f64::EPSILON);
        assert!((bytes_to_gb(1_610_612_736) - 1.5).abs() < f64::EPSILON);
        assert!((round1(2.449) - 2.4).abs() < f64::EPSILON);
    }
}
