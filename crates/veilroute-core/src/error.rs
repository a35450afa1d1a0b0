//! Core protocol errors

use thiserror::Error;
use veilroute_crypto::CryptoError;
use veilroute_network::{CircuitId, NetworkError};

/// Core protocol errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Relay already registered
    #[error("Duplicate relay: {0}")]
    DuplicateError(String),

    /// Relay not in the directory
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// Extending a circuit failed or was not allowed
    #[error("Extend failed: {0}")]
    ExtendError(String),

    /// A layer failed authentication
    #[error("Authentication failure")]
    AuthFailure,

    /// Circuit is not established
    #[error("Circuit not established")]
    NotEstablished,

    /// Too many circuits
    #[error("Circuit capacity reached (max: {max})")]
    CapacityError { max: usize },

    /// Transport stopped while an operation was in flight
    #[error("Transport shut down")]
    TransportShutdown,

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Requested hop count out of range
    #[error("Invalid hop count: {requested} (max: {max})")]
    InvalidHopCount { requested: usize, max: usize },

    /// No path available
    #[error("No path available: not enough usable relays")]
    NoPathAvailable,

    /// Circuit not found
    #[error("Circuit not found: {0}")]
    CircuitNotFound(CircuitId),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(NetworkError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthFailure => Self::AuthFailure,
            other => Self::Crypto(other),
        }
    }
}

impl From<NetworkError> for CoreError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NotRunning => Self::TransportShutdown,
            NetworkError::CryptoError(inner) => inner.into(),
            other => Self::Network(other),
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        assert!(matches!(
            CoreError::from(CryptoError::AuthFailure),
            CoreError::AuthFailure
        ));
        assert!(matches!(
            CoreError::from(CryptoError::EmptyCircuit),
            CoreError::Crypto(CryptoError::EmptyCircuit)
        ));
        assert!(matches!(
            CoreError::from(NetworkError::NotRunning),
            CoreError::TransportShutdown
        ));
        assert!(matches!(
            CoreError::from(NetworkError::CryptoError(CryptoError::AuthFailure)),
            CoreError::AuthFailure
        ));
        assert!(matches!(
            CoreError::from(NetworkError::NotConnected("x".into())),
            CoreError::Network(_)
        ));
    }
}
