//! Collector error type.

use std::time::Duration;

use corelink_core::traits::SampleError;
use corelink_executor::command::CommandBuildError;
use thiserror::Error;

/// Collector error.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Docker is not available")]
    DockerUnavailable,
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Build(#[from] CommandBuildError),
    #[error("Command failed: {0}")]
    Command(String),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CollectorError> for SampleError {
    fn from(err: CollectorError) -> Self {
        match err {
            CollectorError::Io(e) => Self::Io(e),
            other => Self::Unavailable(other.to_string()),
        }
    }
}
