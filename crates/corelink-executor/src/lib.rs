//! Host command execution for the corelink dashboard.
//!
//! Provides:
//! - `ExecutionSession` lifecycle (spawn, stream, timeout, cancel)
//! - `HostSpawner` for host-namespace or local shell execution
//! - `CommandPolicy` admission checks
//! - `PresetCatalog` of built-in commands

pub mod command;
pub mod policy;
pub mod presets;
pub mod session;
pub mod shell;
pub mod spawner;

pub use command::{CommandBuilder, CommandParts, ExecutionContext};
pub use policy::{Admission, CommandPolicy, PolicyError};
pub use presets::{Preset, PresetCatalog};
pub use session::{ExecutionSession, SessionConfig, SessionHandle, SessionReport, SessionStatus};
pub use spawner::HostSpawner;
