//! veilroute Cryptographic Primitives
//!
//! This crate provides the cryptographic building blocks for circuits:
//! - Authenticated encryption (ChaCha20-Poly1305)
//! - Hashing and secure randomness
//! - Ephemeral key exchange (X25519) with HKDF-SHA256 key derivation
//! - The per-hop circuit handshake
//! - Onion layering over ordered hop ciphers

pub mod error;
pub mod handshake;
pub mod hash;
pub mod keys;
pub mod onion;
pub mod symmetric;

pub use error::{CryptoError, CryptoResult};
pub use handshake::{respond, ClientHandshake, HandshakeReply, HandshakeRequest};
pub use hash::{hash, random_array, random_bytes};
pub use keys::{EphemeralKeyPair, HopKeys, PublicKey, SharedSecret};
pub use onion::{peel_all, peel_one, wrap, LayerCipher};
pub use symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::handshake::*;
    pub use crate::hash::*;
    pub use crate::keys::*;
    pub use crate::onion::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// ChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// SHA-256 / BLAKE3 digest size
    pub const DIGEST_SIZE: usize = 32;

    /// Maximum onion layers (hops)
    pub const MAX_ONION_LAYERS: usize = 8;

    /// Maximum application payload carried by one onion packet
    pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
}
