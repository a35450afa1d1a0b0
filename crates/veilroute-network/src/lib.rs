//! veilroute Network Layer
//!
//! Provides network primitives:
//! - TCP transport multiplexer with connection ids and event fan-out
//! - Link framing (CREATE / CREATED / RELAY / DESTROY)
//! - Relay messages carried inside onion layers

pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

use std::time::Duration;

pub use codec::{CircuitId, Frame, FrameDecoder, FrameKind, CIRCUIT_ID_SIZE, MAX_FRAME_PAYLOAD};
pub use error::{NetworkError, NetworkResult};
pub use message::RelayMessage;
pub use transport::{ConnectionId, TransportEvent, TransportMultiplexer};

/// Transport configuration
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Time allowed for an outbound TCP handshake
    pub connect_timeout: Duration,

    /// Initial capacity of each connection's read buffer
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 4096,
        }
    }
}
