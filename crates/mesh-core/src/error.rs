//! Error types for mesh operations

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Reasons a byte buffer is rejected by the codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("frame too short: {actual} bytes, need at least {required}")]
    TooShort { required: usize, actual: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("payload length {declared} exceeds the {available} bytes remaining")]
    PayloadOverrun { declared: usize, available: usize },
}

/// Errors that can occur during mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] InvalidFrame),

    #[error("Authentication failed: ciphertext tag did not verify")]
    AuthenticationFailure,

    #[error("Chunk reassembly timed out for message {0}")]
    ChunkTimeout(u32),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("No public key known for node {0}")]
    UnknownPeerKey(String),

    #[error("Gateway is not active")]
    GatewayInactive,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::TransportFailure(err.to_string())
    }
}
