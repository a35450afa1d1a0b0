//! Onion Encryption Layer
//!
//! Each hop of a circuit shares two [`LayerCipher`]s with the origin: one
//! for traffic moving away from the origin and one for traffic returning.
//! A cipher never transmits its nonce; both ends derive it from the shared
//! seed and a message counter, so every layer is exactly
//! `plaintext + AUTH_TAG_SIZE` bytes and counters must stay in lockstep.
//!
//! Packet shape for hops `[h1, h2, h3]` (outermost first):
//! `seal_h1(seal_h2(seal_h3(payload)))`

use crate::constants::{MAX_ONION_LAYERS, MAX_PAYLOAD_SIZE, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::hash::hash;
use crate::symmetric::{decrypt, encrypt, Nonce, SymmetricKey};

/// One direction of one hop's onion layer
pub struct LayerCipher {
    key: SymmetricKey,
    nonce_seed: [u8; NONCE_SIZE],
    counter: u64,
}

impl LayerCipher {
    /// Create a cipher positioned at the start of its nonce sequence
    pub fn new(key: SymmetricKey, nonce_seed: [u8; NONCE_SIZE]) -> Self {
        Self {
            key,
            nonce_seed,
            counter: 0,
        }
    }

    /// Add this layer, consuming the next nonce
    pub fn seal(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let sealed = encrypt(&self.key, &self.next_nonce(), plaintext)?;
        self.counter += 1;
        Ok(sealed)
    }

    /// Remove this layer using the expected next nonce.
    ///
    /// The counter only advances when the tag verifies.
    pub fn open(&mut self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let opened = decrypt(&self.key, &self.next_nonce(), ciphertext)?;
        self.counter += 1;
        Ok(opened)
    }

    /// Nonce the next `seal`/`open` will use
    pub fn next_nonce(&self) -> Nonce {
        Nonce::from_counter(&self.nonce_seed, self.counter)
    }

    /// Messages processed so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// SHA-256 of the key, safe to compare or log
    pub fn key_fingerprint(&self) -> [u8; 32] {
        hash(self.key.as_bytes())
    }
}

impl std::fmt::Debug for LayerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Wrap `payload` in one layer per hop.
///
/// `layers` is ordered outermost first; encryption runs innermost first so
/// the result is only readable by peeling in hop order.
pub fn wrap(layers: &mut [LayerCipher], payload: &[u8]) -> CryptoResult<Vec<u8>> {
    if layers.is_empty() {
        return Err(CryptoError::EmptyCircuit);
    }

    if layers.len() > MAX_ONION_LAYERS {
        return Err(CryptoError::TooManyLayers {
            max: MAX_ONION_LAYERS,
            actual: layers.len(),
        });
    }

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CryptoError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut packet = payload.to_vec();
    for layer in layers.iter_mut().rev() {
        packet = layer.seal(&packet)?;
    }

    Ok(packet)
}

/// Remove exactly one layer
pub fn peel_one(layer: &mut LayerCipher, packet: &[u8]) -> CryptoResult<Vec<u8>> {
    layer.open(packet)
}

/// Remove one layer per hop, outermost first
pub fn peel_all(layers: &mut [LayerCipher], packet: &[u8]) -> CryptoResult<Vec<u8>> {
    if layers.is_empty() {
        return Err(CryptoError::EmptyCircuit);
    }

    let mut inner = packet.to_vec();
    for layer in layers.iter_mut() {
        inner = layer.open(&inner)?;
    }

    Ok(inner)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::constants::AUTH_TAG_SIZE;

    /// Deterministic (sender, receiver) pairs sharing key and seed
    fn fixed_pairs(n: usize) -> (Vec<LayerCipher>, Vec<LayerCipher>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..n {
            let key = [i as u8 + 1; 32];
            let seed = [i as u8 + 100; NONCE_SIZE];
            senders.push(LayerCipher::new(SymmetricKey::from_bytes(key), seed));
            receivers.push(LayerCipher::new(SymmetricKey::from_bytes(key), seed));
        }
        (senders, receivers)
    }

    #[test]
    fn test_round_trip() {
        for hops in 1..=MAX_ONION_LAYERS {
            let (mut senders, mut receivers) = fixed_pairs(hops);
            let payload = format!("payload through {} hops", hops);

            let packet = wrap(&mut senders, payload.as_bytes()).unwrap();
            assert_eq!(packet.len(), payload.len() + hops * AUTH_TAG_SIZE);

            let mut inner = packet;
            for receiver in receivers.iter_mut() {
                inner = peel_one(receiver, &inner).unwrap();
            }
            assert_eq!(inner, payload.as_bytes());
        }
    }

    #[test]
    fn test_peel_one_leaves_inner_layers() {
        let (mut senders, mut receivers) = fixed_pairs(3);
        let packet = wrap(&mut senders, b"inner").unwrap();

        let after_first = peel_one(&mut receivers[0], &packet).unwrap();
        assert_eq!(after_first.len(), b"inner".len() + 2 * AUTH_TAG_SIZE);

        let rest = peel_all(&mut receivers[1..], &after_first).unwrap();
        assert_eq!(rest, b"inner");
    }

    #[test]
    fn test_many_messages_stay_in_sync() {
        let (mut senders, mut receivers) = fixed_pairs(3);
        for i in 0..50 {
            let msg = format!("message {}", i);
            let packet = wrap(&mut senders, msg.as_bytes()).unwrap();
            let plain = peel_all(&mut receivers, &packet).unwrap();
            assert_eq!(plain, msg.as_bytes());
        }
        assert_eq!(senders[0].counter(), 50);
        assert_eq!(receivers[2].counter(), 50);
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let payload = b"tamper-evident payload";
        let sample_len = payload.len() + 3 * AUTH_TAG_SIZE;
        let offsets = [0, 1, 7, sample_len / 2, sample_len - AUTH_TAG_SIZE, sample_len - 1];

        for &offset in &offsets {
            for bit in [0u8, 3, 7] {
                let (mut senders, mut receivers) = fixed_pairs(3);
                let mut packet = wrap(&mut senders, payload).unwrap();
                packet[offset] ^= 1 << bit;

                let result = peel_one(&mut receivers[0], &packet);
                assert!(
                    matches!(result, Err(CryptoError::AuthFailure)),
                    "flip at byte {} bit {} went undetected",
                    offset,
                    bit
                );
                // Failed open leaves the sequence where it was
                assert_eq!(receivers[0].counter(), 0);
            }
        }
    }

    #[test]
    fn test_inner_tamper_detected_at_inner_hop() {
        let (mut senders, mut receivers) = fixed_pairs(2);
        let packet = wrap(&mut senders, b"data").unwrap();

        let mut inner = peel_one(&mut receivers[0], &packet).unwrap();
        inner[0] ^= 0x80;

        assert!(matches!(
            peel_one(&mut receivers[1], &inner),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let (mut senders, _) = fixed_pairs(1);
        let packet = wrap(&mut senders, b"test").unwrap();

        let mut stranger = LayerCipher::new(SymmetricKey::generate(), [0u8; NONCE_SIZE]);
        assert!(matches!(
            peel_one(&mut stranger, &packet),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_replayed_packet_rejected() {
        let (mut senders, mut receivers) = fixed_pairs(1);
        let packet = wrap(&mut senders, b"once").unwrap();

        peel_one(&mut receivers[0], &packet).unwrap();
        assert!(matches!(
            peel_one(&mut receivers[0], &packet),
            Err(CryptoError::AuthFailure)
        ));
    }

    #[test]
    fn test_nonce_uniqueness() {
        let (mut senders, _) = fixed_pairs(3);
        let mut seen: Vec<HashSet<Nonce>> = vec![HashSet::new(); 3];

        for _ in 0..1000 {
            for (hop, cipher) in senders.iter().enumerate() {
                assert!(seen[hop].insert(cipher.next_nonce()), "nonce reused at hop {}", hop);
            }
            wrap(&mut senders, b"x").unwrap();
        }
        assert!(seen.iter().all(|s| s.len() == 1000));
    }

    #[test]
    fn test_layer_limits() {
        let (mut none, _) = fixed_pairs(0);
        assert!(matches!(wrap(&mut none, b"x"), Err(CryptoError::EmptyCircuit)));

        let (mut too_many, _) = fixed_pairs(MAX_ONION_LAYERS + 1);
        assert!(matches!(
            wrap(&mut too_many, b"x"),
            Err(CryptoError::TooManyLayers { .. })
        ));

        let (mut one, _) = fixed_pairs(1);
        let huge = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            wrap(&mut one, &huge),
            Err(CryptoError::PayloadTooLarge { .. })
        ));
        // Rejected input does not consume a nonce
        assert_eq!(one[0].counter(), 0);
    }
}
