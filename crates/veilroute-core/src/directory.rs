//! Relay Directory
//!
//! Registry of known relays, their trust and capability flags, and the
//! link each one is reached through. Circuits borrow a relay's link with
//! [`RelayDirectory::acquire`] and hand it back with
//! [`RelayDirectory::release`]; the last release closes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use veilroute_network::{ConnectionId, NetworkError, TransportMultiplexer};

use crate::dispatch::LinkDispatcher;
use crate::error::{CoreError, CoreResult};

/// Relay capability flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_hidden_services: bool,
    pub is_exit: bool,
    pub is_guard: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_hidden_services: true,
            is_exit: false,
            is_guard: false,
        }
    }
}

/// A relay known to the directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNode {
    /// Unique relay identifier
    pub node_id: String,
    pub address: String,
    pub port: u16,
    pub trusted: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl RelayNode {
    /// Create a relay with default capabilities
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, port: u16, trusted: bool) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            port,
            trusted,
            capabilities: Capabilities::default(),
        }
    }
}

struct RelayEntry {
    node: RelayNode,
    link: Option<ConnectionId>,
    /// Circuits currently using `link`
    refs: usize,
}

/// Registry of relays and their links
pub struct RelayDirectory {
    transport: Arc<TransportMultiplexer>,
    /// Told about links we close, since the transport stays silent about them
    dispatcher: Option<Arc<LinkDispatcher>>,
    nodes: Mutex<HashMap<String, RelayEntry>>,
}

impl RelayDirectory {
    /// Create an empty directory using `transport` for links
    pub fn new(transport: Arc<TransportMultiplexer>) -> Self {
        Self {
            transport,
            dispatcher: None,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a directory whose link closures reach the circuits routed by
    /// `dispatcher`
    pub fn with_dispatcher(transport: Arc<TransportMultiplexer>, dispatcher: Arc<LinkDispatcher>) -> Self {
        Self {
            transport,
            dispatcher: Some(dispatcher),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn close_link(&self, link: &str) {
        self.transport.disconnect(link);
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.link_closed(link);
        }
    }

    /// Register a relay with default capabilities
    pub fn add_relay(&self, node_id: &str, address: &str, port: u16, trusted: bool) -> CoreResult<()> {
        self.insert(RelayNode::new(node_id, address, port, trusted))
    }

    /// Register a fully described relay
    pub fn insert(&self, node: RelayNode) -> CoreResult<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&node.node_id) {
            return Err(CoreError::DuplicateError(node.node_id));
        }

        debug!(
            "Added relay {} ({}:{}, trusted: {})",
            node.node_id, node.address, node.port, node.trusted
        );
        nodes.insert(
            node.node_id.clone(),
            RelayEntry {
                node,
                link: None,
                refs: 0,
            },
        );
        Ok(())
    }

    /// Register a relay from a `host:port` string, using the string as node id
    pub fn add_relay_from_str(&self, addr: &str, trusted: bool) -> CoreResult<String> {
        let (host, port) = parse_host_port(addr)?;
        let node_id = addr.trim().to_string();
        self.add_relay(&node_id, &host, port, trusted)?;
        Ok(node_id)
    }

    /// Add every `host:port` entry as a trusted relay.
    /// Malformed or duplicate entries are skipped. Returns how many were added.
    pub fn load_trusted(&self, relays: &[String]) -> usize {
        let mut added = 0;
        for addr in relays {
            match self.add_relay_from_str(addr, true) {
                Ok(_) => added += 1,
                Err(e) => warn!("Skipping trusted relay entry {:?}: {}", addr, e),
            }
        }

        info!("Loaded {} of {} trusted relays", added, relays.len());
        added
    }

    /// Remove a relay, closing its link
    pub fn remove_relay(&self, node_id: &str) -> Option<RelayNode> {
        let entry = self.nodes.lock().remove(node_id)?;
        if let Some(link) = entry.link {
            self.close_link(&link);
        }
        debug!("Removed relay {}", node_id);
        Some(entry.node)
    }

    /// Look up a relay
    pub fn get(&self, node_id: &str) -> Option<RelayNode> {
        self.nodes.lock().get(node_id).map(|e| e.node.clone())
    }

    /// All relays
    pub fn all(&self) -> Vec<RelayNode> {
        self.nodes.lock().values().map(|e| e.node.clone()).collect()
    }

    /// Trusted relays
    pub fn trusted(&self) -> Vec<RelayNode> {
        self.nodes
            .lock()
            .values()
            .filter(|e| e.node.trusted)
            .map(|e| e.node.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn trusted_count(&self) -> usize {
        self.nodes.lock().values().filter(|e| e.node.trusted).count()
    }

    /// Relays with an established link
    pub fn connected_count(&self) -> usize {
        // The transport lock nests inside ours and never the other way round
        let nodes = self.nodes.lock();
        nodes
            .values()
            .filter_map(|e| e.link.as_deref())
            .filter(|link| self.transport.is_connected(link))
            .count()
    }

    pub fn set_trusted(&self, node_id: &str, trusted: bool) -> CoreResult<()> {
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownRelay(node_id.to_string()))?;
        entry.node.trusted = trusted;
        Ok(())
    }

    pub fn set_capabilities(&self, node_id: &str, capabilities: Capabilities) -> CoreResult<()> {
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownRelay(node_id.to_string()))?;
        entry.node.capabilities = capabilities;
        Ok(())
    }

    /// Pick a relay uniformly at random among those matching `filter`
    pub fn select_random<F>(&self, filter: F) -> Option<RelayNode>
    where
        F: Fn(&RelayNode) -> bool,
    {
        let nodes = self.nodes.lock();
        let candidates: Vec<&RelayEntry> = nodes.values().filter(|e| filter(&e.node)).collect();
        candidates.choose(&mut OsRng).map(|e| e.node.clone())
    }

    /// Open (or reuse) the link to a relay
    pub async fn connect(&self, node_id: &str) -> CoreResult<ConnectionId> {
        let (address, port, existing) = {
            let nodes = self.nodes.lock();
            let entry = nodes
                .get(node_id)
                .ok_or_else(|| CoreError::UnknownRelay(node_id.to_string()))?;
            (entry.node.address.clone(), entry.node.port, entry.link.clone())
        };

        if let Some(link) = existing {
            if self.transport.has_connection(&link) {
                return Ok(link);
            }
        }

        let link = match self.transport.connect(&address, port).await {
            Ok(link) => link,
            // Someone else opened it first
            Err(NetworkError::AlreadyConnected(link)) => link,
            Err(e) => return Err(e.into()),
        };

        if let Some(entry) = self.nodes.lock().get_mut(node_id) {
            entry.link = Some(link.clone());
        }
        debug!("Relay {} linked via {}", node_id, link);
        Ok(link)
    }

    /// Close a relay's link. Circuits riding on it are told it is gone.
    /// Returns whether there was a link to close.
    pub fn disconnect(&self, node_id: &str) -> bool {
        let link = self.nodes.lock().get_mut(node_id).and_then(|e| {
            e.refs = 0;
            e.link.take()
        });
        match link {
            Some(link) => {
                self.close_link(&link);
                debug!("Relay {} unlinked", node_id);
                true
            }
            None => false,
        }
    }

    /// Relay has an established link
    pub fn is_connected(&self, node_id: &str) -> bool {
        let nodes = self.nodes.lock();
        nodes
            .get(node_id)
            .and_then(|e| e.link.as_deref())
            .map(|link| self.transport.is_connected(link))
            .unwrap_or(false)
    }

    /// Connect and take a reference on the relay's link
    pub async fn acquire(&self, node_id: &str) -> CoreResult<ConnectionId> {
        let link = self.connect(node_id).await?;
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .get_mut(node_id)
            .ok_or_else(|| CoreError::UnknownRelay(node_id.to_string()))?;
        entry.refs += 1;
        Ok(link)
    }

    /// Drop a reference taken by [`acquire`](Self::acquire) on `link`.
    /// Ignored if the relay has since moved to another link.
    pub fn release(&self, node_id: &str, link: &str) {
        let link = {
            let mut nodes = self.nodes.lock();
            let Some(entry) = nodes.get_mut(node_id) else {
                return;
            };
            if entry.refs == 0 || entry.link.as_deref() != Some(link) {
                return;
            }
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            entry.link.take()
        };

        if let Some(link) = link {
            self.close_link(&link);
            debug!("Released last circuit on {}, link closed", node_id);
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn parse_host_port(addr: &str) -> CoreResult<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CoreError::ConfigError(format!("Expected host:port, got {:?}", addr)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CoreError::ConfigError(format!("Missing host in {:?}", addr)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| CoreError::ConfigError(format!("Invalid port in {:?}", addr)))?;

    Ok((host.to_string(), port))
}
