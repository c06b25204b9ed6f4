//! Core abstractions for the corelink operator dashboard.
//!
//! This crate provides the fundamental building blocks:
//! - `Frame` - Typed wire frame enum shared by server and client
//! - `SampleSnapshot` - Immutable periodic GPU/system samples
//! - `LineBuffer` - Bounded, oldest-first evicting line history
//! - `Spawner`, `LogSource` and `SampleSource` collaborator traits

pub mod frame;
pub mod line_buffer;
pub mod snapshot;
pub mod traits;

pub use frame::Frame;
pub use line_buffer::LineBuffer;
pub use snapshot::{GpuDevice, SampleKind, SamplePayload, SampleSnapshot, SystemStats};
pub use traits::{ChannelId, LogSource, SampleSource, SessionId, Spawner};
