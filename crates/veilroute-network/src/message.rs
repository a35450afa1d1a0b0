//! Relay messages carried inside onion layers
//!
//! Format: [Tag: 1 byte][fields...], every variable field length-prefixed.
//! The tag keeps handshake traffic distinguishable from application data
//! once a hop has peeled its layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use veilroute_crypto::{HandshakeReply, HandshakeRequest};

use crate::error::{NetworkError, NetworkResult};

const TAG_EXTEND: u8 = 0x10;
const TAG_EXTENDED: u8 = 0x11;
const TAG_DATA: u8 = 0x12;

/// Body of a relay cell after the last layer is peeled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Ask the last hop to extend the circuit to `host:port`
    Extend {
        host: String,
        port: u16,
        request: HandshakeRequest,
    },

    /// The new hop's handshake reply, relayed back to the origin
    Extended(HandshakeReply),

    /// Application payload
    Data(Bytes),
}

impl RelayMessage {
    /// Serialize to bytes
    pub fn encode(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Self::Extend {
                host,
                port,
                request,
            } => {
                let host_len = u16::try_from(host.len())
                    .map_err(|_| NetworkError::InvalidFrame("host name too long".into()))?;
                let request = request.to_bytes()?;
                buf.put_u8(TAG_EXTEND);
                buf.put_u16(host_len);
                buf.put_slice(host.as_bytes());
                buf.put_u16(*port);
                buf.put_u32(request.len() as u32);
                buf.put_slice(&request);
            }
            Self::Extended(reply) => {
                let reply = reply.to_bytes();
                buf.put_u8(TAG_EXTENDED);
                buf.put_u32(reply.len() as u32);
                buf.put_slice(&reply);
            }
            Self::Data(data) => {
                buf.put_u8(TAG_DATA);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
        Ok(buf.freeze())
    }

    /// Deserialize from bytes. Trailing bytes are rejected.
    pub fn decode(mut bytes: &[u8]) -> NetworkResult<Self> {
        let tag = take_u8(&mut bytes)?;
        let message = match tag {
            TAG_EXTEND => {
                let host_len = take_u16(&mut bytes)? as usize;
                let host = std::str::from_utf8(take(&mut bytes, host_len)?)
                    .map_err(|_| NetworkError::InvalidFrame("host is not UTF-8".into()))?
                    .to_string();
                let port = take_u16(&mut bytes)?;
                let request_len = take_u32(&mut bytes)? as usize;
                let request = HandshakeRequest::from_bytes(take(&mut bytes, request_len)?)?;
                Self::Extend {
                    host,
                    port,
                    request,
                }
            }
            TAG_EXTENDED => {
                let len = take_u32(&mut bytes)? as usize;
                Self::Extended(HandshakeReply::from_bytes(take(&mut bytes, len)?)?)
            }
            TAG_DATA => {
                let len = take_u32(&mut bytes)? as usize;
                Self::Data(Bytes::copy_from_slice(take(&mut bytes, len)?))
            }
            other => {
                return Err(NetworkError::InvalidFrame(format!(
                    "Unknown relay message tag: 0x{:02x}",
                    other
                )))
            }
        };

        if !bytes.is_empty() {
            return Err(NetworkError::InvalidFrame(format!(
                "{} trailing bytes after relay message",
                bytes.len()
            )));
        }
        Ok(message)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extend { .. } => "EXTEND",
            Self::Extended(_) => "EXTENDED",
            Self::Data(_) => "DATA",
        }
    }
}

fn take<'a>(bytes: &mut &'a [u8], n: usize) -> NetworkResult<&'a [u8]> {
    if bytes.len() < n {
        return Err(NetworkError::InvalidFrame(format!(
            "Relay message truncated: need {} bytes, have {}",
            n,
            bytes.len()
        )));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn take_u8(bytes: &mut &[u8]) -> NetworkResult<u8> {
    Ok(take(bytes, 1)?[0])
}

fn take_u16(bytes: &mut &[u8]) -> NetworkResult<u16> {
    let mut field = take(bytes, 2)?;
    Ok(field.get_u16())
}

fn take_u32(bytes: &mut &[u8]) -> NetworkResult<u32> {
    let mut field = take(bytes, 4)?;
    Ok(field.get_u32())
}
