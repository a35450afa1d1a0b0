//! Hashing and secure randomness
//!
//! Every identifier and key in the system draws from `OsRng` through
//! these helpers rather than from ad hoc generators.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::DIGEST_SIZE;

/// Collision-resistant hash (SHA-256)
pub fn hash(data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `n` bytes from the operating system CSPRNG
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Fixed-size random array from the operating system CSPRNG
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
