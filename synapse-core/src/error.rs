//! Error types for Synapse operations

/// Result type for Synapse operations
pub type Result<T> = std::result::Result<T, SynapseError>;

/// Error types for the Synapse event bus
#[derive(Debug, thiserror::Error)]
pub enum SynapseError {
    /// Hub-level errors (role transitions, lifecycle)
    #[error("Hub error: {0}")]
    Hub(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A frame could not be decoded; fatal to the owning connection
    #[error("Corrupt frame: {0}")]
    FrameCorrupt(String),

    /// Duplicate balanced subscription key
    #[error("Only one listener per (type, filter id, selector value) is allowed: {0}")]
    DuplicateFilter(String),

    /// Invalid filter specification
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Hub is not ready for the requested operation
    #[error("Hub is not ready")]
    NotReady,

    /// Peer channel or connection has gone away
    #[error("Peer channel closed")]
    ChannelClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for SynapseError {
    fn from(s: String) -> Self {
        SynapseError::Other(s)
    }
}

impl From<&str> for SynapseError {
    fn from(s: &str) -> Self {
        SynapseError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for SynapseError {
    fn from(err: anyhow::Error) -> Self {
        SynapseError::Other(err.to_string())
    }
}

impl SynapseError {
    /// True when a bind failure should fall back to client mode:
    /// the endpoint is already served by another hub.
    pub fn is_addr_taken(&self) -> bool {
        match self {
            SynapseError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable
            ),
            _ => false,
        }
    }
}
