//! Onion router
//!
//! Composition root for the client side: owns the transport, the relay
//! directory, the link dispatcher and the circuit manager, and wires them
//! together explicitly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use veilroute_network::{TransportConfig, TransportMultiplexer};

use crate::circuit::CircuitContext;
use crate::config::RouterConfig;
use crate::directory::RelayDirectory;
use crate::dispatch::LinkDispatcher;
use crate::error::{CoreError, CoreResult};
use crate::manager::{CircuitManager, SharedCircuit};

/// Client-side onion router
pub struct OnionRouter {
    config: RouterConfig,
    transport: Arc<TransportMultiplexer>,
    directory: Arc<RelayDirectory>,
    dispatcher: Arc<LinkDispatcher>,
    manager: Arc<CircuitManager>,
    relays_loaded: AtomicBool,
}

impl OnionRouter {
    /// Validate `config` and assemble the router. Nothing runs until `start`.
    pub fn new(config: RouterConfig) -> CoreResult<Self> {
        config.validate()?;

        let transport = Arc::new(TransportMultiplexer::new(TransportConfig {
            connect_timeout: config.connect_timeout,
            ..Default::default()
        }));
        let dispatcher = LinkDispatcher::new(transport.clone());
        let directory = Arc::new(RelayDirectory::with_dispatcher(
            transport.clone(),
            dispatcher.clone(),
        ));
        let ctx = CircuitContext {
            transport: transport.clone(),
            directory: directory.clone(),
            dispatcher: dispatcher.clone(),
            max_hops: config.max_hops,
            extend_timeout: config.extend_timeout,
        };
        let manager = Arc::new(CircuitManager::new(ctx, config.clone()));

        Ok(Self {
            config,
            transport,
            directory,
            dispatcher,
            manager,
            relays_loaded: AtomicBool::new(false),
        })
    }

    /// Start the transport and background tasks. Returns the listen address.
    pub async fn start(&self) -> CoreResult<SocketAddr> {
        self.transport
            .initialize(self.config.listen_port, &self.config.listen_address)?;
        self.dispatcher.start();
        let addr = self.transport.start().await?;

        if !self.relays_loaded.swap(true, Ordering::SeqCst) {
            self.directory.load_trusted(&self.config.trusted_relays);
        }
        self.manager.spawn_sweeper();

        info!("Onion router started on {}", addr);
        Ok(addr)
    }

    /// Open links to every trusted relay. Returns how many were initiated.
    pub async fn connect_to_network(&self) -> CoreResult<usize> {
        let relays = self.directory.trusted();
        if relays.is_empty() {
            warn!("No trusted relays configured");
            return Ok(0);
        }

        let mut connected = 0;
        for relay in &relays {
            match self.directory.connect(&relay.node_id).await {
                Ok(_) => connected += 1,
                Err(CoreError::TransportShutdown) => return Err(CoreError::TransportShutdown),
                Err(e) => warn!("Failed to connect to relay {}: {}", relay.node_id, e),
            }
        }

        info!("Connecting to {} of {} trusted relays", connected, relays.len());
        Ok(connected)
    }

    /// Close the link to every trusted relay. Circuits built over those
    /// links fail. Returns how many links were closed.
    pub fn disconnect_from_network(&self) -> usize {
        let closed = self
            .directory
            .trusted()
            .iter()
            .filter(|relay| self.directory.disconnect(&relay.node_id))
            .count();

        info!("Disconnected from {} trusted relays", closed);
        closed
    }

    /// Close all circuits and stop every task. Circuits blocked in
    /// `receive_data` are woken rather than waited on.
    pub async fn stop(&self) {
        self.manager.shutdown().await;
        // In-flight extends see the transport shutdown
        self.transport.stop().await;
        self.dispatcher.stop();
        info!("Onion router stopped");
    }

    /// Build a circuit with `hop_count` hops
    pub async fn create_circuit(&self, hop_count: usize) -> CoreResult<SharedCircuit> {
        self.manager.create_circuit(hop_count).await
    }

    /// Build a circuit with the configured default length
    pub async fn create_default_circuit(&self) -> CoreResult<SharedCircuit> {
        self.manager.create_circuit(self.config.circuit_length).await
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CircuitManager> {
        &self.manager
    }

    pub fn directory(&self) -> &Arc<RelayDirectory> {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<TransportMultiplexer> {
        &self.transport
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }
}
