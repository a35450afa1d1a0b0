//! Relay Node Operations
//!
//! The relay side of the protocol: answer handshakes, peel one forward
//! layer, add one backward layer, and pass cells between the previous and
//! next hop. The last hop of a circuit also acts on EXTEND and DATA.
//!
//! All per-circuit state lives in a single event-loop task, so handlers
//! take `&mut self` and need no locking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use veilroute_crypto::{peel_one, respond, HandshakeReply, HandshakeRequest, LayerCipher};
use veilroute_network::{
    CircuitId, ConnectionId, Frame, FrameDecoder, FrameKind, NetworkError, RelayMessage,
    TransportConfig, TransportEvent, TransportMultiplexer,
};

use crate::config::{ExitPolicy, RelayConfig};
use crate::error::{CoreError, CoreResult};

/// A circuit as seen on one link: (connection, circuit id on that link)
type LinkKey = (ConnectionId, CircuitId);

/// Per-circuit relay state, keyed by the previous hop's link
struct RelayCircuit {
    prev: LinkKey,
    /// Set once an EXTEND opened the next hop
    next: Option<LinkKey>,
    /// Opens the origin's forward layer
    forward: LayerCipher,
    /// Seals our backward layer
    backward: LayerCipher,
    /// CREATE sent to the next hop, CREATED not yet seen
    pending_extend: bool,
}

/// Outcome of opening a next-hop link for an EXTEND
struct LinkReady {
    key: LinkKey,
    target: String,
    request: HandshakeRequest,
    link: Result<ConnectionId, NetworkError>,
}

#[derive(Default)]
struct RelayStats {
    circuits: AtomicUsize,
    outbound_links: AtomicUsize,
}

/// Onion relay service
pub struct OnionRelay {
    config: RelayConfig,
    transport: Arc<TransportMultiplexer>,
    stats: Arc<RelayStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OnionRelay {
    pub fn new(config: RelayConfig) -> Self {
        let transport = TransportMultiplexer::new(TransportConfig {
            connect_timeout: config.connect_timeout,
            ..Default::default()
        });
        Self {
            config,
            transport: Arc::new(transport),
            stats: Arc::new(RelayStats::default()),
            task: Mutex::new(None),
        }
    }

    /// Bind the listener and start relaying
    pub async fn start(&self) -> CoreResult<SocketAddr> {
        self.transport
            .initialize(self.config.listen_port, &self.config.listen_address)?;

        // Subscribe first so no early event is missed
        let events = self.transport.subscribe();
        let addr = self.transport.start().await?;

        let (link_ready, link_ready_rx) = mpsc::unbounded_channel();
        let state = RelayState {
            transport: self.transport.clone(),
            link_ready,
            exit_policy: self.config.exit_policy,
            stats: self.stats.clone(),
            circuits: HashMap::new(),
            by_next: HashMap::new(),
            outbound: HashMap::new(),
            decoders: HashMap::new(),
        };
        *self.task.lock() = Some(tokio::spawn(state.run(events, link_ready_rx)));

        info!("Relay listening on {} (exit policy: {:?})", addr, self.config.exit_policy);
        Ok(addr)
    }

    /// Stop relaying and close every link
    pub async fn stop(&self) {
        self.transport.stop().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Relay stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Circuits currently passing through this relay
    pub fn circuit_count(&self) -> usize {
        self.stats.circuits.load(Ordering::Relaxed)
    }

    /// All open links, inbound and outbound
    pub fn link_count(&self) -> usize {
        self.transport.connection_count()
    }

    /// Links this relay opened toward next hops
    pub fn outbound_link_count(&self) -> usize {
        self.stats.outbound_links.load(Ordering::Relaxed)
    }
}

struct RelayState {
    transport: Arc<TransportMultiplexer>,
    /// Next-hop links opened off the event loop report back here
    link_ready: mpsc::UnboundedSender<LinkReady>,
    exit_policy: ExitPolicy,
    stats: Arc<RelayStats>,
    circuits: HashMap<LinkKey, RelayCircuit>,
    /// Next-hop key -> previous-hop key
    by_next: HashMap<LinkKey, LinkKey>,
    /// Outbound links and how many circuits use each
    outbound: HashMap<ConnectionId, usize>,
    decoders: HashMap<ConnectionId, FrameDecoder>,
}

impl RelayState {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut link_ready: mpsc::UnboundedReceiver<LinkReady>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Connected(link)) => {
                        trace!("Link up: {}", link);
                        self.decoders.insert(link, FrameDecoder::new());
                    }
                    Some(TransportEvent::Data(link, bytes)) => self.on_data(link, bytes),
                    Some(TransportEvent::Disconnected(link)) => self.on_link_lost(&link),
                    Some(TransportEvent::Shutdown) | None => break,
                },
                Some(ready) = link_ready.recv() => self.on_link_ready(ready),
            }
            self.publish_stats();
        }

        self.circuits.clear();
        self.by_next.clear();
        self.outbound.clear();
        self.publish_stats();
        debug!("Relay event loop exited");
    }

    fn publish_stats(&self) {
        self.stats.circuits.store(self.circuits.len(), Ordering::Relaxed);
        self.stats
            .outbound_links
            .store(self.outbound.len(), Ordering::Relaxed);
    }

    fn on_data(&mut self, link: ConnectionId, bytes: Bytes) {
        let mut frames = Vec::new();
        let decoder = self.decoders.entry(link.clone()).or_default();
        decoder.extend(&bytes);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("Protocol violation on {}: {}, dropping link", link, e);
                    self.transport.disconnect(&link);
                    self.on_link_lost(&link);
                    return;
                }
            }
        }

        for frame in frames {
            let kind = frame.kind;
            let id = frame.circuit_id;
            let result = match kind {
                FrameKind::Create => self.handle_create(&link, frame),
                FrameKind::Created => self.handle_created(&link, frame),
                FrameKind::RelayForward => self.handle_relay_forward(&link, frame),
                FrameKind::RelayBackward => self.handle_relay_backward(&link, frame),
                FrameKind::Destroy => {
                    self.handle_destroy(&link, id);
                    Ok(())
                }
            };

            if let Err(e) = result {
                debug!("Error handling {:?} for {} on {}: {}", kind, id, link, e);
            }
        }
    }

    fn send(&self, link: &str, frame: Frame) {
        let result = frame
            .encode()
            .map_err(CoreError::from)
            .and_then(|bytes| self.transport.send(link, bytes).map_err(CoreError::from));
        if let Err(e) = result {
            debug!("Failed to send {:?} on {}: {}", frame.kind, link, e);
        }
    }

    /// First contact from a previous hop
    fn handle_create(&mut self, link: &ConnectionId, frame: Frame) -> CoreResult<()> {
        let key = (link.clone(), frame.circuit_id);
        if self.circuits.contains_key(&key) {
            return Err(CoreError::ProtocolError("CREATE for existing circuit".into()));
        }

        let handshake = HandshakeRequest::from_bytes(&frame.payload)
            .and_then(|request| respond(&request));
        let (reply, keys) = match handshake {
            Ok(done) => done,
            Err(e) => {
                self.send(link, Frame::destroy(frame.circuit_id));
                return Err(e.into());
            }
        };

        let (forward, backward) = keys.into_ciphers();
        self.circuits.insert(
            key,
            RelayCircuit {
                prev: (link.clone(), frame.circuit_id),
                next: None,
                forward,
                backward,
                pending_extend: false,
            },
        );
        self.send(
            link,
            Frame::new(FrameKind::Created, frame.circuit_id, reply.to_bytes()),
        );
        debug!("Circuit {} created from {}", frame.circuit_id, link);
        Ok(())
    }

    /// Next hop answered our CREATE: report EXTENDED to the origin
    fn handle_created(&mut self, link: &ConnectionId, frame: Frame) -> CoreResult<()> {
        let next = (link.clone(), frame.circuit_id);
        let prev = self
            .by_next
            .get(&next)
            .cloned()
            .ok_or_else(|| CoreError::ProtocolError("CREATED for unknown circuit".into()))?;
        let circuit = self
            .circuits
            .get_mut(&prev)
            .ok_or_else(|| CoreError::ProtocolError("CREATED for unknown circuit".into()))?;
        if !circuit.pending_extend {
            return Err(CoreError::ProtocolError("unsolicited CREATED".into()));
        }
        circuit.pending_extend = false;

        let sealed = HandshakeReply::from_bytes(&frame.payload)
            .map_err(CoreError::from)
            .and_then(|reply| Ok(RelayMessage::Extended(reply).encode()?))
            .and_then(|message| Ok(circuit.backward.seal(&message)?));

        match sealed {
            Ok(cell) => {
                self.send(&prev.0, Frame::new(FrameKind::RelayBackward, prev.1, cell));
                debug!("Circuit {} extended to {}", prev.1, link);
                Ok(())
            }
            Err(e) => {
                self.destroy_circuit(&prev);
                Err(e)
            }
        }
    }

    /// Cell moving away from the origin
    fn handle_relay_forward(&mut self, link: &ConnectionId, frame: Frame) -> CoreResult<()> {
        let key = (link.clone(), frame.circuit_id);
        let Some(circuit) = self.circuits.get_mut(&key) else {
            trace!("RELAY for unknown circuit {} on {}", frame.circuit_id, link);
            return Ok(());
        };

        let inner = match peel_one(&mut circuit.forward, &frame.payload) {
            Ok(inner) => inner,
            Err(e) => {
                warn!("Circuit {} sent a cell that failed authentication", frame.circuit_id);
                self.destroy_circuit(&key);
                return Err(e.into());
            }
        };

        if let Some((next_link, next_id)) = circuit.next.clone() {
            self.send(&next_link, Frame::new(FrameKind::RelayForward, next_id, inner));
            return Ok(());
        }

        // We are the last hop
        match RelayMessage::decode(&inner) {
            Ok(RelayMessage::Extend {
                host,
                port,
                request,
            }) => self.extend(key, host, port, request),
            Ok(RelayMessage::Data(data)) => match self.exit_policy {
                ExitPolicy::Echo => {
                    let sealed = RelayMessage::Data(data)
                        .encode()
                        .map_err(CoreError::from)
                        .and_then(|message| Ok(circuit.backward.seal(&message)?));
                    match sealed {
                        Ok(cell) => {
                            self.send(link, Frame::new(FrameKind::RelayBackward, frame.circuit_id, cell));
                            Ok(())
                        }
                        Err(e) => {
                            self.destroy_circuit(&key);
                            Err(e)
                        }
                    }
                }
                ExitPolicy::Discard => {
                    trace!("Discarding {} bytes on circuit {}", data.len(), frame.circuit_id);
                    Ok(())
                }
            },
            Ok(other) => {
                self.destroy_circuit(&key);
                Err(CoreError::ProtocolError(format!(
                    "unexpected {} at last hop",
                    other.name()
                )))
            }
            Err(e) => {
                self.destroy_circuit(&key);
                Err(e.into())
            }
        }
    }

    /// Open (or reuse) the link to `host:port` and send CREATE there.
    ///
    /// A new link is resolved and opened in its own task; the CREATE goes
    /// out from [`on_link_ready`](Self::on_link_ready).
    fn extend(
        &mut self,
        key: LinkKey,
        host: String,
        port: u16,
        request: HandshakeRequest,
    ) -> CoreResult<()> {
        match self.circuits.get_mut(&key) {
            Some(circuit) if !circuit.pending_extend && circuit.next.is_none() => {
                circuit.pending_extend = true;
            }
            _ => {
                self.destroy_circuit(&key);
                return Err(CoreError::ProtocolError("EXTEND while extend pending".into()));
            }
        }

        let target = format!("{}:{}", host, port);
        if self.transport.has_connection(&target) {
            self.send_create(key, target, request);
            return Ok(());
        }

        let transport = self.transport.clone();
        let ready = self.link_ready.clone();
        tokio::spawn(async move {
            let link = match transport.connect(&host, port).await {
                Ok(id) | Err(NetworkError::AlreadyConnected(id)) => Ok(id),
                Err(e) => Err(e),
            };
            let _ = ready.send(LinkReady {
                key,
                target,
                request,
                link,
            });
        });
        Ok(())
    }

    fn on_link_ready(&mut self, ready: LinkReady) {
        let LinkReady {
            key,
            target,
            request,
            link,
        } = ready;

        let link = match link {
            Ok(link) => link,
            Err(e) => {
                warn!("Cannot extend circuit {} to {}: {}", key.1, target, e);
                self.destroy_circuit(&key);
                return;
            }
        };

        let waiting = self
            .circuits
            .get(&key)
            .map(|c| c.pending_extend && c.next.is_none())
            .unwrap_or(false);
        if !waiting {
            // Circuit went away while the link was opening
            if !self.outbound.contains_key(&link) {
                self.transport.disconnect(&link);
            }
            return;
        }

        self.send_create(key, link, request);
    }

    fn send_create(&mut self, key: LinkKey, next_link: ConnectionId, request: HandshakeRequest) {
        let payload = match request.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Cannot encode CREATE for circuit {}: {}", key.1, e);
                self.destroy_circuit(&key);
                return;
            }
        };
        *self.outbound.entry(next_link.clone()).or_insert(0) += 1;

        let mut next_id = CircuitId::random();
        while self.by_next.contains_key(&(next_link.clone(), next_id)) {
            next_id = CircuitId::random();
        }
        let next = (next_link.clone(), next_id);
        self.by_next.insert(next.clone(), key.clone());
        if let Some(circuit) = self.circuits.get_mut(&key) {
            circuit.next = Some(next);
        }

        self.send(&next_link, Frame::new(FrameKind::Create, next_id, payload));
        debug!("Circuit {} extending to {} as {}", key.1, next_link, next_id);
    }

    /// Cell moving toward the origin: add our layer
    fn handle_relay_backward(&mut self, link: &ConnectionId, frame: Frame) -> CoreResult<()> {
        let next = (link.clone(), frame.circuit_id);
        let Some(prev) = self.by_next.get(&next).cloned() else {
            trace!("Backward RELAY for unknown circuit {} on {}", frame.circuit_id, link);
            return Ok(());
        };
        let Some(circuit) = self.circuits.get_mut(&prev) else {
            return Ok(());
        };

        match circuit.backward.seal(&frame.payload) {
            Ok(cell) => {
                self.send(&prev.0, Frame::new(FrameKind::RelayBackward, prev.1, cell));
                Ok(())
            }
            Err(e) => {
                self.destroy_circuit(&prev);
                Err(e.into())
            }
        }
    }

    fn handle_destroy(&mut self, link: &ConnectionId, id: CircuitId) {
        let key = (link.clone(), id);
        if let Some(circuit) = self.circuits.remove(&key) {
            // From the origin side: pass it on
            if let Some(next) = circuit.next {
                self.send(&next.0, Frame::destroy(next.1));
                self.by_next.remove(&next);
                self.release_link(&next.0);
            }
            debug!("Circuit {} destroyed by previous hop", id);
        } else if let Some(prev) = self.by_next.remove(&key) {
            // From the exit side: report back
            self.circuits.remove(&prev);
            self.send(&prev.0, Frame::destroy(prev.1));
            self.release_link(link);
            debug!("Circuit {} destroyed by next hop", prev.1);
        }
    }

    /// Destroy a circuit in both directions
    fn destroy_circuit(&mut self, key: &LinkKey) {
        let Some(circuit) = self.circuits.remove(key) else {
            return;
        };
        self.send(&circuit.prev.0, Frame::destroy(circuit.prev.1));
        if let Some(next) = circuit.next {
            self.send(&next.0, Frame::destroy(next.1));
            self.by_next.remove(&next);
            self.release_link(&next.0);
        }
        debug!("Circuit {} torn down", circuit.prev.1);
    }

    /// Drop one circuit's use of an outbound link; the last user closes it
    fn release_link(&mut self, link: &str) {
        let Some(users) = self.outbound.get_mut(link) else {
            return;
        };
        *users = users.saturating_sub(1);
        if *users == 0 {
            self.outbound.remove(link);
            self.transport.disconnect(link);
            debug!("Closed idle link {}", link);
        }
    }

    fn on_link_lost(&mut self, link: &str) {
        self.decoders.remove(link);
        self.outbound.remove(link);

        // Circuits that came in on this link: destroy forward
        let inbound: Vec<LinkKey> = self
            .circuits
            .keys()
            .filter(|(prev_link, _)| prev_link == link)
            .cloned()
            .collect();
        for key in &inbound {
            if let Some(circuit) = self.circuits.remove(key) {
                if let Some(next) = circuit.next {
                    self.send(&next.0, Frame::destroy(next.1));
                    self.by_next.remove(&next);
                    self.release_link(&next.0);
                }
            }
        }

        // Circuits that went out on this link: destroy backward
        let outbound: Vec<(LinkKey, LinkKey)> = self
            .by_next
            .iter()
            .filter(|((next_link, _), _)| next_link == link)
            .map(|(next, prev)| (next.clone(), prev.clone()))
            .collect();
        for (next, prev) in &outbound {
            self.by_next.remove(next);
            if self.circuits.remove(prev).is_some() {
                self.send(&prev.0, Frame::destroy(prev.1));
            }
        }

        if !inbound.is_empty() || !outbound.is_empty() {
            info!(
                "Link {} lost, destroyed {} circuits",
                link,
                inbound.len() + outbound.len()
            );
        }
    }
}
