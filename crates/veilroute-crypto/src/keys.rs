//! X25519 Key Exchange
//!
//! Ephemeral Diffie-Hellman used once per hop during circuit extension,
//! and the HKDF derivation of the per-hop key set.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::onion::LayerCipher;
use crate::symmetric::SymmetricKey;

/// HKDF salt for hop key derivation
const HOP_KEY_SALT: &[u8] = b"veilroute:hop-keys:v1";

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// An ephemeral keypair for single-use key exchange
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

/// Shared secret derived from X25519 key exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.bytes[..4]))
    }
}

impl EphemeralKeyPair {
    /// Generate a new ephemeral keypair (single use)
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            secret,
            public: PublicKey {
                bytes: public.to_bytes(),
            },
        }
    }

    /// Perform Diffie-Hellman and consume the ephemeral secret.
    ///
    /// Rejects low-order peer keys that would force an all-zero secret.
    pub fn diffie_hellman(self, their_public: &PublicKey) -> CryptoResult<SharedSecret> {
        let their_public = X25519Public::from(their_public.bytes);
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(SharedSecret {
            bytes: shared.to_bytes(),
        })
    }
}

impl SharedSecret {
    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }

    /// Derive the per-hop key set, binding it to the handshake transcript
    pub fn derive_hop_keys(&self, transcript: &[u8]) -> CryptoResult<HopKeys> {
        let hkdf = Hkdf::<Sha256>::new(Some(HOP_KEY_SALT), &self.bytes);
        let expand = |label: &[u8], out: &mut [u8]| -> CryptoResult<()> {
            let mut info = Vec::with_capacity(label.len() + transcript.len());
            info.extend_from_slice(label);
            info.extend_from_slice(transcript);
            hkdf.expand(&info, out)
                .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
        };

        let mut keys = HopKeys {
            forward_key: [0u8; SYMMETRIC_KEY_SIZE],
            backward_key: [0u8; SYMMETRIC_KEY_SIZE],
            forward_seed: [0u8; NONCE_SIZE],
            backward_seed: [0u8; NONCE_SIZE],
            confirm_key: [0u8; SYMMETRIC_KEY_SIZE],
        };
        expand(b"forward-key:", &mut keys.forward_key)?;
        expand(b"backward-key:", &mut keys.backward_key)?;
        expand(b"forward-nonce:", &mut keys.forward_seed)?;
        expand(b"backward-nonce:", &mut keys.backward_seed)?;
        expand(b"confirm-key:", &mut keys.confirm_key)?;

        Ok(keys)
    }
}

/// Key material shared by the circuit origin and one hop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Encrypts origin -> hop traffic
    forward_key: [u8; SYMMETRIC_KEY_SIZE],
    /// Encrypts hop -> origin traffic
    backward_key: [u8; SYMMETRIC_KEY_SIZE],
    forward_seed: [u8; NONCE_SIZE],
    backward_seed: [u8; NONCE_SIZE],
    /// Only used to authenticate the handshake reply
    confirm_key: [u8; SYMMETRIC_KEY_SIZE],
}

impl HopKeys {
    /// Keyed BLAKE3 over the transcript, proving possession of the keys
    pub fn confirmation(&self, transcript: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.confirm_key, transcript)
    }

    /// Split into the (forward, backward) layer ciphers, both counters at zero
    pub fn into_ciphers(self) -> (LayerCipher, LayerCipher) {
        let forward = LayerCipher::new(SymmetricKey::from_bytes(self.forward_key), self.forward_seed);
        let backward =
            LayerCipher::new(SymmetricKey::from_bytes(self.backward_key), self.backward_seed);
        (forward, backward)
    }
}
