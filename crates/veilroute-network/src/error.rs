//! Network error types

use std::net::SocketAddr;

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (e.g. unparsable bind address)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Listener could not be bound
    #[error("Bind error on {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Host could not be resolved
    #[error("Address error: {0}")]
    AddressError(String),

    /// A connection with this id already exists
    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    /// Already running
    #[error("Already running")]
    AlreadyRunning,

    /// Multiplexer is not running
    #[error("Transport is not running")]
    NotRunning,

    /// No such connection
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Invalid frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Declared frame length exceeds the limit
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Crypto error (from veilroute-crypto)
    #[error("Crypto error: {0}")]
    CryptoError(#[from] veilroute_crypto::CryptoError),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
