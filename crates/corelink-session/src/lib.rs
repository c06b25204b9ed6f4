//! Channel orchestration for the corelink dashboard.
//!
//! Provides:
//! - `ChannelRegistry` - Route client requests and release channel resources
//! - `LogTailCursor` - Follow one container's log stream per channel
//! - `SamplePoller` / `SampleHub` - Interval sampling with fan-out

pub mod log_tail;
pub mod poller;
pub mod registry;

pub use log_tail::{LineSplitter, LogTailCursor};
pub use poller::{MIN_POLL_INTERVAL, PollerStats, SampleHub, SamplePoller};
pub use registry::{
    ChannelInfo, ChannelRegistry, Collaborators, LogicalStream, RegistryConfig, Released,
    Request, RouteError,
};
