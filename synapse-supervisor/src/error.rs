//! Error types for supervisor operations

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for the supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Only a listening hub can fork children")]
    NotListening,

    #[error("Cannot spawn child hubs without being ready")]
    NotReady,

    #[error("Child binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<synapse_core::error::SynapseError> for SupervisorError {
    fn from(err: synapse_core::error::SynapseError) -> Self {
        SupervisorError::Other(anyhow::anyhow!("{}", err))
    }
}
