//! Host collectors for the corelink dashboard.
//!
//! Provides:
//! - `DockerCollector` - Container listing and log following via the Docker API
//! - `GpuSampler` - NVIDIA device readings from `nvidia-smi`
//! - `SystemSampler` - CPU, memory, disk and uptime via `sysinfo`

pub mod docker;
pub mod error;
pub mod gpu;
pub mod system;

pub use docker::{ContainerSummary, DockerCollector};
pub use error::CollectorError;
pub use gpu::{GpuSampler, parse_nvidia_smi};
pub use system::SystemSampler;
