//! veilroute Core Protocol
//!
//! Implements the onion routing core:
//! - Relay directory and random path selection
//! - Circuit construction by telescoping handshakes
//! - Circuit management (capacity, retries, idle sweeping)
//! - The relay-side forwarding service

pub mod circuit;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod relay;
pub mod router;

pub use circuit::{Circuit, CircuitContext, CircuitHop, CircuitState};
pub use config::{ExitPolicy, RelayConfig, RouterConfig};
pub use directory::{Capabilities, RelayDirectory, RelayNode};
pub use dispatch::{CircuitSignal, LinkDispatcher};
pub use error::{CoreError, CoreResult};
pub use manager::{CircuitManager, SharedCircuit};
pub use relay::OnionRelay;
pub use router::OnionRouter;

pub use veilroute_network::CircuitId;

/// Default circuit length
pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;
