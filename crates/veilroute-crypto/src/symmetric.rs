//! Symmetric Encryption (ChaCha20-Poly1305)
//!
//! Authenticated encryption used for every onion layer. Ciphertexts
//! carry the 16-byte Poly1305 tag; any bit flip fails authentication.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce as ChaNonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::hash::random_array;

/// A 256-bit symmetric key for ChaCha20-Poly1305
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// A 96-bit nonce for ChaCha20-Poly1305
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> Self {
        Self {
            bytes: random_array(),
        }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Nonce {
    /// Create a nonce from raw bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Nonce for position `counter` in a sequence seeded by `seed`.
    /// Distinct counters always yield distinct nonces for the same seed.
    pub fn from_counter(seed: &[u8; NONCE_SIZE], counter: u64) -> Self {
        let mut bytes = *seed;
        // XOR counter into the last 8 bytes
        let counter_bytes = counter.to_le_bytes();
        for i in 0..8 {
            bytes[i + 4] ^= counter_bytes[i];
        }
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.bytes))
    }
}

/// Encrypt plaintext using ChaCha20-Poly1305
///
/// Returns ciphertext with authentication tag appended (16 bytes longer than input)
pub fn encrypt(key: &SymmetricKey, nonce: &Nonce, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    cipher
        .encrypt(ChaNonce::from_slice(&nonce.bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("ChaCha20-Poly1305 encryption failed".into()))
}

/// Decrypt ciphertext using ChaCha20-Poly1305
///
/// Fails with [`CryptoError::AuthFailure`] if the tag does not verify.
pub fn decrypt(key: &SymmetricKey, nonce: &Nonce, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < AUTH_TAG_SIZE {
        return Err(CryptoError::AuthFailure);
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.bytes).map_err(|_| CryptoError::AuthFailure)?;

    cipher
        .decrypt(ChaNonce::from_slice(&nonce.bytes), ciphertext)
        .map_err(|_| CryptoError::AuthFailure)
}
