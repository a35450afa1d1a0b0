//! Circuit Extension Handshake
//!
//! One-round ephemeral X25519 exchange performed once per hop:
//!
//! ```text
//! origin -> hop : HandshakeRequest { target_node_id, ephemeral_public }
//! hop -> origin : HandshakeReply   { ephemeral_public, confirmation }
//! ```
//!
//! Both sides derive [`HopKeys`] from the DH output bound to the transcript
//! `node_id || origin_public || hop_public`. The confirmation is a keyed
//! BLAKE3 of the transcript under the derived confirm key, so a reply from
//! anyone who did not complete the exchange fails verification.

use crate::constants::{DIGEST_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{EphemeralKeyPair, HopKeys, PublicKey};

const TRANSCRIPT_LABEL: &[u8] = b"veilroute:handshake:v1";

/// Wire size of an encoded reply
pub const REPLY_SIZE: usize = X25519_KEY_SIZE + DIGEST_SIZE;

/// Extension request, readable only by the hop being added
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub target_node_id: String,
    pub ephemeral_public: PublicKey,
}

/// Hop's answer to a [`HandshakeRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub ephemeral_public: PublicKey,
    pub confirmation: [u8; DIGEST_SIZE],
}

impl HandshakeRequest {
    /// Encode as `[u16 id_len][node_id][32 ephemeral_public]`
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let id = self.target_node_id.as_bytes();
        let id_len = u16::try_from(id.len())
            .map_err(|_| CryptoError::MalformedPacket("node id too long".into()))?;

        let mut out = Vec::with_capacity(2 + id.len() + X25519_KEY_SIZE);
        out.extend_from_slice(&id_len.to_be_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(self.ephemeral_public.as_bytes());
        Ok(out)
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < 2 {
            return Err(CryptoError::MalformedPacket("handshake request too short".into()));
        }
        let id_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() != 2 + id_len + X25519_KEY_SIZE {
            return Err(CryptoError::MalformedPacket(format!(
                "handshake request length {} does not match node id length {}",
                bytes.len(),
                id_len
            )));
        }

        let target_node_id = std::str::from_utf8(&bytes[2..2 + id_len])
            .map_err(|_| CryptoError::MalformedPacket("node id is not UTF-8".into()))?
            .to_string();
        let ephemeral_public = PublicKey::try_from_slice(&bytes[2 + id_len..])?;

        Ok(Self {
            target_node_id,
            ephemeral_public,
        })
    }
}

impl HandshakeReply {
    /// Encode as `[32 ephemeral_public][32 confirmation]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPLY_SIZE);
        out.extend_from_slice(self.ephemeral_public.as_bytes());
        out.extend_from_slice(&self.confirmation);
        out
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != REPLY_SIZE {
            return Err(CryptoError::MalformedPacket(format!(
                "handshake reply must be {} bytes, got {}",
                REPLY_SIZE,
                bytes.len()
            )));
        }
        let ephemeral_public = PublicKey::try_from_slice(&bytes[..X25519_KEY_SIZE])?;
        let mut confirmation = [0u8; DIGEST_SIZE];
        confirmation.copy_from_slice(&bytes[X25519_KEY_SIZE..]);

        Ok(Self {
            ephemeral_public,
            confirmation,
        })
    }
}

/// Origin side of one hop's handshake
pub struct ClientHandshake {
    target_node_id: String,
    ephemeral: EphemeralKeyPair,
}

impl ClientHandshake {
    /// Start a handshake with the relay known as `target_node_id`
    pub fn new(target_node_id: impl Into<String>) -> Self {
        Self {
            target_node_id: target_node_id.into(),
            ephemeral: EphemeralKeyPair::generate(),
        }
    }

    /// The request to deliver to the target hop
    pub fn request(&self) -> HandshakeRequest {
        HandshakeRequest {
            target_node_id: self.target_node_id.clone(),
            ephemeral_public: self.ephemeral.public,
        }
    }

    /// Verify the reply and derive the hop keys. Consumes the ephemeral secret.
    pub fn complete(self, reply: &HandshakeReply) -> CryptoResult<HopKeys> {
        let transcript = transcript(
            &self.target_node_id,
            &self.ephemeral.public,
            &reply.ephemeral_public,
        );
        let shared = self.ephemeral.diffie_hellman(&reply.ephemeral_public)?;
        let keys = shared.derive_hop_keys(&transcript)?;

        // blake3::Hash equality is constant time
        if keys.confirmation(&transcript) != blake3::Hash::from(reply.confirmation) {
            return Err(CryptoError::HandshakeFailed(
                "key confirmation did not verify".into(),
            ));
        }

        Ok(keys)
    }
}

/// Hop side: answer a request and derive the same hop keys
pub fn respond(request: &HandshakeRequest) -> CryptoResult<(HandshakeReply, HopKeys)> {
    let ephemeral = EphemeralKeyPair::generate();
    let our_public = ephemeral.public;
    let transcript = transcript(
        &request.target_node_id,
        &request.ephemeral_public,
        &our_public,
    );

    let shared = ephemeral.diffie_hellman(&request.ephemeral_public)?;
    let keys = shared.derive_hop_keys(&transcript)?;
    let reply = HandshakeReply {
        ephemeral_public: our_public,
        confirmation: *keys.confirmation(&transcript).as_bytes(),
    };

    Ok((reply, keys))
}

fn transcript(node_id: &str, origin: &PublicKey, hop: &PublicKey) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(TRANSCRIPT_LABEL.len() + 2 + node_id.len() + 2 * X25519_KEY_SIZE);
    out.extend_from_slice(TRANSCRIPT_LABEL);
    out.extend_from_slice(&(node_id.len() as u16).to_be_bytes());
    out.extend_from_slice(node_id.as_bytes());
    out.extend_from_slice(origin.as_bytes());
    out.extend_from_slice(hop.as_bytes());
    out
}
