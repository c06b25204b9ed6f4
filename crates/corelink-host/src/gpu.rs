//! GPU sampling via `nvidia-smi`.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use corelink_core::{
    GpuDevice, SampleKind, SamplePayload, SampleSnapshot,
    traits::{SampleError, SampleSource},
};
use corelink_executor::{CommandBuilder, ExecutionContext};
use tokio::process::Command;

use crate::error::CollectorError;

/// Fields requested from `nvidia-smi`, in column order.
pub const GPU_QUERY_FIELDS: &str = "index,name,temperature.gpu,utilization.gpu,utilization.memory,\
memory.used,memory.total,memory.free,power.draw,power.limit,fan.speed";

/// Upper bound on one `nvidia-smi` run.
pub const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const FIELD_COUNT: usize = 11;

/// Parse `--format=csv,noheader,nounits` output.
///
/// Rows with too few columns or unparsable numbers are skipped. A fan
/// speed of `[N/A]` is reported as `None`.
#[must_use]
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuDevice> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < FIELD_COUNT {
                tracing::debug!(line, "Skipping short nvidia-smi row");
                return None;
            }
            parse_row(&parts)
        })
        .collect()
}

fn parse_row(parts: &[&str]) -> Option<GpuDevice> {
    Some(GpuDevice {
        index: parts[0].parse().ok()?,
        name: parts[1].to_string(),
        temperature_c: parts[2].parse().ok()?,
        gpu_utilization_pct: parts[3].parse().ok()?,
        memory_utilization_pct: parts[4].parse().ok()?,
        memory_used_mb: parts[5].parse().ok()?,
        memory_total_mb: parts[6].parse().ok()?,
        memory_free_mb: parts[7].parse().ok()?,
        power_draw_w: parts[8].parse().ok()?,
        power_limit_w: parts[9].parse().ok()?,
        fan_speed_pct: match parts[10] {
            "[N/A]" => None,
            fan => Some(fan.parse().ok()?),
        },
    })
}

/// GPU sample source. A disabled sampler reports no devices.
#[derive(Debug, Clone)]
pub struct GpuSampler {
    enabled: bool,
    builder: CommandBuilder,
    timeout: Duration,
}

impl GpuSampler {
    #[must_use]
    pub const fn new(enabled: bool, context: ExecutionContext) -> Self {
        Self {
            enabled,
            builder: CommandBuilder::new(context),
            timeout: GPU_QUERY_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current device readings.
    ///
    /// # Errors
    /// Returns error if `nvidia-smi` cannot be run, exits non-zero, or
    /// exceeds the query timeout.
    pub async fn devices(&self) -> Result<Vec<GpuDevice>, CollectorError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let query = format!("--query-gpu={GPU_QUERY_FIELDS}");
        let parts = self
            .builder
            .direct(["nvidia-smi", query.as_str(), "--format=csv,noheader,nounits"])?;
        let (program, args) = parts.into_resolved().await?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CollectorError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollectorError::Command(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl SampleSource for GpuSampler {
    fn kind(&self) -> SampleKind {
        SampleKind::Gpu
    }

    async fn gather(&self) -> Result<SampleSnapshot, SampleError> {
        let devices = self.devices().await?;
        Ok(SampleSnapshot::now(SamplePayload::Gpu(devices)))
    }
}
