//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication tag did not verify (tampering, wrong key or nonce desync)
    #[error("Authentication failed: integrity check did not verify")]
    AuthFailure,

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Packet or handshake bytes are malformed
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Too many onion layers
    #[error("Too many onion layers: maximum is {max}, got {actual}")]
    TooManyLayers { max: usize, actual: usize },

    /// No layers given for wrapping
    #[error("Circuit must have at least one hop")]
    EmptyCircuit,

    /// Payload exceeds the onion payload limit
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Handshake confirmation did not verify
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
