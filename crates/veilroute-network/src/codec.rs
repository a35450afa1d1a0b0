//! Link framing for veilroute
//!
//! Wire format:
//! [Kind: 1 byte][Circuit ID: 16 bytes][Length: 4 bytes BE][Payload: Length bytes]
//!
//! TCP delivers a byte stream, so [`FrameDecoder`] buffers reads until a
//! whole frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Circuit identifier size in bytes (128 bits)
pub const CIRCUIT_ID_SIZE: usize = 16;

/// Frame header size (kind + circuit_id + length)
pub const FRAME_HEADER_SIZE: usize = 1 + CIRCUIT_ID_SIZE + 4;

/// Maximum frame payload
pub const MAX_FRAME_PAYLOAD: usize = 128 * 1024;

/// Random 128-bit circuit identifier, unique per link
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId([u8; CIRCUIT_ID_SIZE]);

impl CircuitId {
    /// Draw a fresh id from the secure random source
    pub fn random() -> Self {
        Self(veilroute_crypto::random_array())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; CIRCUIT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; CIRCUIT_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering (32 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CircuitId({})", self.to_hex())
    }
}

/// Frame kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// First-hop handshake request
    Create = 0x01,

    /// First-hop handshake reply
    Created = 0x02,

    /// Onion cell moving away from the circuit origin
    RelayForward = 0x03,

    /// Onion cell moving toward the circuit origin
    RelayBackward = 0x04,

    /// Circuit teardown
    Destroy = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(Self::Create),
            0x02 => Ok(Self::Created),
            0x03 => Ok(Self::RelayForward),
            0x04 => Ok(Self::RelayBackward),
            0x05 => Ok(Self::Destroy),
            _ => Err(NetworkError::InvalidFrame(format!(
                "Unknown frame kind: 0x{:02x}",
                value
            ))),
        }
    }
}

/// A link-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub circuit_id: CircuitId,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, circuit_id: CircuitId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            circuit_id,
            payload: payload.into(),
        }
    }

    /// Create a teardown frame
    pub fn destroy(circuit_id: CircuitId) -> Self {
        Self::new(FrameKind::Destroy, circuit_id, Bytes::new())
    }

    /// Serialize frame to bytes
    pub fn encode(&self) -> NetworkResult<Bytes> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(NetworkError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_slice(self.circuit_id.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Get total encoded size
    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Reassembles frames from a byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the link
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` if more bytes are needed.
    ///
    /// An error means the stream is corrupt and the link should be dropped.
    pub fn next_frame(&mut self) -> NetworkResult<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Validate header before waiting on the payload
        let kind = FrameKind::try_from(self.buf[0])?;
        let len_offset = 1 + CIRCUIT_ID_SIZE;
        let len = u32::from_be_bytes([
            self.buf[len_offset],
            self.buf[len_offset + 1],
            self.buf[len_offset + 2],
            self.buf[len_offset + 3],
        ]) as usize;

        if len > MAX_FRAME_PAYLOAD {
            return Err(NetworkError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        if self.buf.len() < FRAME_HEADER_SIZE + len {
            self.buf.reserve(FRAME_HEADER_SIZE + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(1);
        let mut id = [0u8; CIRCUIT_ID_SIZE];
        self.buf.copy_to_slice(&mut id);
        self.buf.advance(4);
        let payload = self.buf.split_to(len).freeze();

        Ok(Some(Frame {
            kind,
            circuit_id: CircuitId(id),
            payload,
        }))
    }
}
