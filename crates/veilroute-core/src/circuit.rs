//! Circuit Management
//!
//! A circuit is an encrypted path through several relays. The origin
//! shares one forward and one backward layer key with every hop, so each
//! relay peels (or adds) exactly one layer and only learns its neighbours.
//!
//! Circuits are built by telescoping: the first hop is reached with a
//! CREATE frame over a direct link, every later hop through an EXTEND
//! message carried inside the existing layers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use veilroute_crypto::{peel_all, wrap, ClientHandshake, HandshakeReply, LayerCipher};
use veilroute_network::{
    CircuitId, ConnectionId, Frame, FrameKind, RelayMessage, TransportMultiplexer,
};

use crate::directory::{RelayDirectory, RelayNode};
use crate::dispatch::{CircuitSignal, LinkDispatcher};
use crate::error::{CoreError, CoreResult};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Created, no hops yet
    New,
    /// At least one hop negotiated
    Building,
    /// Ready for traffic
    Established,
    /// Closed by the owner
    Closed,
    /// Torn down after an error
    Failed,
}

impl CircuitState {
    /// Closed and Failed admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn can_transition_to(&self, next: CircuitState) -> bool {
        use CircuitState::*;
        match (self, next) {
            (New, Building) | (Building, Established) => true,
            (New | Building | Established, Closed | Failed) => true,
            _ => false,
        }
    }
}

/// Key material shared with one hop
pub struct CircuitHop {
    pub node_id: String,
    /// Layer the origin seals toward the exit
    pub forward: LayerCipher,
    /// Layer the hop seals toward the origin
    pub backward: LayerCipher,
}

/// Shared collaborators every circuit needs
#[derive(Clone)]
pub struct CircuitContext {
    pub transport: Arc<TransportMultiplexer>,
    pub directory: Arc<RelayDirectory>,
    pub dispatcher: Arc<LinkDispatcher>,
    pub max_hops: usize,
    pub extend_timeout: Duration,
}

/// An onion circuit, owned by one task at a time
pub struct Circuit {
    id: CircuitId,
    state: CircuitState,

    /// Hop order is outermost (guard) first; the three vectors stay aligned
    node_ids: Vec<String>,
    forward: Vec<LayerCipher>,
    backward: Vec<LayerCipher>,

    created_at: Instant,
    last_activity: Instant,

    /// Guard relay whose link this circuit holds a reference on
    guard: Option<String>,
    link: Option<ConnectionId>,
    inbox: mpsc::UnboundedReceiver<CircuitSignal>,
    ctx: CircuitContext,
}

impl Circuit {
    /// Create an empty circuit with a fresh id
    pub fn new(ctx: CircuitContext) -> Self {
        let (id, inbox) = ctx.dispatcher.register();
        let now = Instant::now();
        Self {
            id,
            state: CircuitState::New,
            node_ids: Vec::new(),
            forward: Vec::new(),
            backward: Vec::new(),
            created_at: now,
            last_activity: now,
            guard: None,
            link: None,
            inbox,
            ctx,
        }
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == CircuitState::Established
    }

    pub fn hop_count(&self) -> usize {
        self.node_ids.len()
    }

    /// Relays in hop order, guard first
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    /// SHA-256 of each hop's forward key
    pub fn hop_key_fingerprints(&self) -> Vec<[u8; 32]> {
        self.forward.iter().map(|c| c.key_fingerprint()).collect()
    }

    /// Messages sealed so far under each hop's forward key
    pub fn forward_counters(&self) -> Vec<u64> {
        self.forward.iter().map(|c| c.counter()).collect()
    }

    /// Link to the guard, once the first hop is in place
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn set_state(&mut self, state: CircuitState) -> CoreResult<()> {
        if !self.state.can_transition_to(state) {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", state),
            });
        }
        debug!("Circuit {} state: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Add one hop at the end of the circuit.
    ///
    /// Caller errors (terminal or established circuit, hop limit, repeated
    /// relay) leave the state untouched. Any failure while negotiating
    /// fails the circuit.
    pub async fn extend(&mut self, node_id: &str) -> CoreResult<()> {
        match self.state {
            CircuitState::Closed | CircuitState::Failed => {
                return Err(CoreError::ExtendError(format!(
                    "circuit {} is {:?}",
                    self.id, self.state
                )));
            }
            CircuitState::Established => {
                return Err(CoreError::ExtendError(format!(
                    "circuit {} is already established",
                    self.id
                )));
            }
            CircuitState::New | CircuitState::Building => {}
        }
        if self.hop_count() >= self.ctx.max_hops {
            return Err(CoreError::ExtendError(format!(
                "circuit {} already has {} hops",
                self.id,
                self.hop_count()
            )));
        }
        if self.node_ids.iter().any(|n| n == node_id) {
            return Err(CoreError::ExtendError(format!(
                "relay {} is already in circuit {}",
                node_id, self.id
            )));
        }

        let Some(node) = self.ctx.directory.get(node_id) else {
            self.fail();
            return Err(CoreError::ExtendError(format!("unknown relay {}", node_id)));
        };

        let result = if self.node_ids.is_empty() {
            self.create_first_hop(&node).await
        } else {
            self.extend_through(&node).await
        };

        match result {
            Ok(hop) => {
                self.node_ids.push(hop.node_id);
                self.forward.push(hop.forward);
                self.backward.push(hop.backward);
                if self.state == CircuitState::New {
                    self.set_state(CircuitState::Building)?;
                }
                self.touch();
                debug!(
                    "Circuit {} extended to {} ({} hops)",
                    self.id,
                    node_id,
                    self.hop_count()
                );
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(match e {
                    CoreError::TransportShutdown | CoreError::ExtendError(_) => e,
                    other => CoreError::ExtendError(format!("{}: {}", node_id, other)),
                })
            }
        }
    }

    async fn create_first_hop(&mut self, node: &RelayNode) -> CoreResult<CircuitHop> {
        let link = self.ctx.directory.acquire(&node.node_id).await?;
        self.guard = Some(node.node_id.clone());
        self.link = Some(link.clone());
        self.ctx.dispatcher.bind(self.id, &link);

        // A link that died before the bind produced no signal for us
        if !self.ctx.transport.has_connection(&link) {
            return Err(CoreError::ExtendError(format!("link to {} closed", node.node_id)));
        }

        let handshake = ClientHandshake::new(node.node_id.clone());
        let request = handshake.request().to_bytes()?;
        self.send_frame(Frame::new(FrameKind::Create, self.id, request))?;

        let frame = self.wait_for(FrameKind::Created).await?;
        let reply = HandshakeReply::from_bytes(&frame.payload)?;
        let (forward, backward) = handshake.complete(&reply)?.into_ciphers();

        Ok(CircuitHop {
            node_id: node.node_id.clone(),
            forward,
            backward,
        })
    }

    async fn extend_through(&mut self, node: &RelayNode) -> CoreResult<CircuitHop> {
        let handshake = ClientHandshake::new(node.node_id.clone());
        let message = RelayMessage::Extend {
            host: node.address.clone(),
            port: node.port,
            request: handshake.request(),
        }
        .encode()?;

        let cell = wrap(&mut self.forward, &message)?;
        self.send_frame(Frame::new(FrameKind::RelayForward, self.id, cell))?;

        let frame = self.wait_for(FrameKind::RelayBackward).await?;
        let body = peel_all(&mut self.backward, &frame.payload)?;
        let reply = match RelayMessage::decode(&body)? {
            RelayMessage::Extended(reply) => reply,
            other => {
                return Err(CoreError::ProtocolError(format!(
                    "expected EXTENDED, got {}",
                    other.name()
                )))
            }
        };
        let (forward, backward) = handshake.complete(&reply)?.into_ciphers();

        Ok(CircuitHop {
            node_id: node.node_id.clone(),
            forward,
            backward,
        })
    }

    /// Wait for a frame of `kind`, bounded by the extend timeout
    async fn wait_for(&mut self, kind: FrameKind) -> CoreResult<Frame> {
        let id = self.id;
        let inbox = &mut self.inbox;
        let wait = async {
            loop {
                match inbox.recv().await {
                    Some(CircuitSignal::Frame(frame)) if frame.kind == kind => return Ok(frame),
                    Some(CircuitSignal::Frame(frame)) if frame.kind == FrameKind::Destroy => {
                        return Err(CoreError::ExtendError("destroyed by relay".into()))
                    }
                    Some(CircuitSignal::Frame(frame)) => {
                        debug!("Circuit {} ignoring {:?} while waiting for {:?}", id, frame.kind, kind);
                    }
                    Some(CircuitSignal::LinkClosed) => {
                        return Err(CoreError::ExtendError("link closed".into()))
                    }
                    Some(CircuitSignal::Close) => {
                        return Err(CoreError::ExtendError("circuit closed".into()))
                    }
                    Some(CircuitSignal::Shutdown) | None => return Err(CoreError::TransportShutdown),
                }
            }
        };

        tokio::time::timeout(self.ctx.extend_timeout, wait)
            .await
            .map_err(|_| CoreError::ExtendError(format!("no {:?} within {:?}", kind, self.ctx.extend_timeout)))?
    }

    /// Building -> Established
    pub fn finalize(&mut self) -> CoreResult<()> {
        if self.state != CircuitState::Building || self.node_ids.is_empty() {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", CircuitState::Established),
            });
        }
        self.set_state(CircuitState::Established)?;
        info!(
            "Circuit {} established: {}",
            self.id,
            self.node_ids.join(" -> ")
        );
        Ok(())
    }

    /// Send application data to the exit
    pub async fn send_data(&mut self, data: &[u8]) -> CoreResult<()> {
        if !self.is_established() {
            return Err(CoreError::NotEstablished);
        }

        let message = RelayMessage::Data(Bytes::copy_from_slice(data)).encode()?;
        let cell = wrap(&mut self.forward, &message)?;
        if let Err(e) = self.send_frame(Frame::new(FrameKind::RelayForward, self.id, cell)) {
            warn!("Circuit {} lost its link: {}", self.id, e);
            self.fail();
            return Err(e);
        }

        self.touch();
        Ok(())
    }

    /// Wait for the next application payload from the exit.
    ///
    /// Returns `NotEstablished` (and leaves the circuit Closed) if the
    /// owner closes the circuit while waiting.
    pub async fn receive_data(&mut self) -> CoreResult<Bytes> {
        if !self.is_established() {
            return Err(CoreError::NotEstablished);
        }

        loop {
            let frame = match self.inbox.recv().await {
                Some(CircuitSignal::Frame(frame)) => frame,
                Some(CircuitSignal::LinkClosed) => {
                    self.fail();
                    return Err(CoreError::ProtocolError(format!(
                        "circuit {} lost its link",
                        self.id
                    )));
                }
                Some(CircuitSignal::Close) => {
                    self.close();
                    return Err(CoreError::NotEstablished);
                }
                Some(CircuitSignal::Shutdown) | None => {
                    self.fail();
                    return Err(CoreError::TransportShutdown);
                }
            };

            match frame.kind {
                FrameKind::RelayBackward => {}
                FrameKind::Destroy => {
                    self.fail();
                    return Err(CoreError::ProtocolError(format!(
                        "circuit {} destroyed by relay",
                        self.id
                    )));
                }
                other => {
                    debug!("Circuit {} ignoring {:?}", self.id, other);
                    continue;
                }
            }

            let body = match peel_all(&mut self.backward, &frame.payload) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Circuit {} received a cell that failed authentication", self.id);
                    self.fail();
                    return Err(e.into());
                }
            };

            match RelayMessage::decode(&body) {
                Ok(RelayMessage::Data(data)) => {
                    self.touch();
                    return Ok(data);
                }
                Ok(other) => debug!("Circuit {} ignoring {} message", self.id, other.name()),
                Err(e) => {
                    warn!("Circuit {} received an unreadable relay message: {}", self.id, e);
                    self.fail();
                    return Err(e.into());
                }
            }
        }
    }

    fn send_frame(&self, frame: Frame) -> CoreResult<()> {
        let link = self.link.as_ref().ok_or(CoreError::NotEstablished)?;
        self.ctx.transport.send(link, frame.encode()?)?;
        Ok(())
    }

    /// Tear the circuit down. No-op once closed or failed.
    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.terminate(CircuitState::Closed);
        info!("Circuit {} closed", self.id);
    }

    /// Tear the circuit down after an error. No-op once closed or failed.
    pub fn fail(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.terminate(CircuitState::Failed);
        warn!("Circuit {} failed", self.id);
    }

    fn terminate(&mut self, state: CircuitState) {
        // Relays propagate DESTROY hop by hop
        if self.link.is_some() {
            let _ = self.send_frame(Frame::destroy(self.id));
        }

        self.ctx.dispatcher.deregister(self.id);
        if let (Some(guard), Some(link)) = (self.guard.take(), self.link.take()) {
            self.ctx.directory.release(&guard, &link);
        }

        // Closed and Failed are reachable from every live state
        let _ = self.set_state(state);
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!("Circuit {} dropped while {:?}", self.id, self.state);
            self.terminate(CircuitState::Closed);
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("hops", &self.node_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use veilroute_network::TransportConfig;

    use super::*;

    fn context() -> CircuitContext {
        let transport = Arc::new(TransportMultiplexer::new(TransportConfig::default()));
        let dispatcher = LinkDispatcher::new(transport.clone());
        CircuitContext {
            directory: Arc::new(RelayDirectory::with_dispatcher(transport.clone(), dispatcher.clone())),
            dispatcher,
            transport,
            max_hops: 3,
            extend_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_state_transitions() {
        use CircuitState::*;
        assert!(New.can_transition_to(Building));
        assert!(Building.can_transition_to(Established));
        assert!(Established.can_transition_to(Closed));
        assert!(New.can_transition_to(Failed));
        assert!(!New.can_transition_to(Established));
        assert!(!Established.can_transition_to(Building));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Closed));
    }

    #[tokio::test]
    async fn test_send_before_established() {
        let mut circuit = Circuit::new(context());
        assert_eq!(circuit.state(), CircuitState::New);
        assert!(matches!(
            circuit.send_data(b"hello").await,
            Err(CoreError::NotEstablished)
        ));
        assert!(matches!(
            circuit.receive_data().await,
            Err(CoreError::NotEstablished)
        ));
        assert!(matches!(
            circuit.finalize(),
            Err(CoreError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let ctx = context();
        let mut circuit = Circuit::new(ctx.clone());
        assert_eq!(ctx.dispatcher.route_count(), 1);

        circuit.close();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(ctx.dispatcher.route_count(), 0);

        circuit.close();
        circuit.fail();
        assert_eq!(circuit.state(), CircuitState::Closed);

        assert!(matches!(
            circuit.extend("anything").await,
            Err(CoreError::ExtendError(_))
        ));
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_relay_fails_circuit() {
        let ctx = context();
        let mut circuit = Circuit::new(ctx.clone());

        assert!(matches!(
            circuit.extend("missing").await,
            Err(CoreError::ExtendError(_))
        ));
        assert_eq!(circuit.state(), CircuitState::Failed);
        assert_eq!(ctx.dispatcher.route_count(), 0);

        // Terminal: further extends are rejected without side effects
        assert!(matches!(
            circuit.extend("missing").await,
            Err(CoreError::ExtendError(_))
        ));
        assert_eq!(circuit.state(), CircuitState::Failed);
    }

    #[tokio::test]
    async fn test_stopped_transport_reports_shutdown() {
        let ctx = context();
        ctx.directory.add_relay("a", "127.0.0.1", 9, true).unwrap();

        let mut circuit = Circuit::new(ctx.clone());
        assert!(matches!(
            circuit.extend("a").await,
            Err(CoreError::TransportShutdown)
        ));
        assert_eq!(circuit.state(), CircuitState::Failed);
        assert_eq!(circuit.hop_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let ctx = context();
        {
            let _circuit = Circuit::new(ctx.clone());
            let _other = Circuit::new(ctx.clone());
            assert_eq!(ctx.dispatcher.route_count(), 2);
        }
        assert_eq!(ctx.dispatcher.route_count(), 0);
    }
}
