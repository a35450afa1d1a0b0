//! Link dispatcher
//!
//! Sits between the transport and the circuits built on it. Reassembles
//! frames per connection and hands each one to the circuit registered
//! under its id, provided it arrived on the link that circuit is bound to.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use veilroute_network::{
    CircuitId, ConnectionId, Frame, FrameDecoder, TransportEvent, TransportMultiplexer,
};

/// What a circuit can receive from its link
#[derive(Debug)]
pub enum CircuitSignal {
    /// A frame addressed to the circuit
    Frame(Frame),
    /// The circuit's link went away
    LinkClosed,
    /// The owner is tearing the circuit down
    Close,
    /// The transport stopped
    Shutdown,
}

struct Route {
    link: Option<ConnectionId>,
    inbox: mpsc::UnboundedSender<CircuitSignal>,
}

/// Routes inbound frames to circuit inboxes
pub struct LinkDispatcher {
    transport: Arc<TransportMultiplexer>,
    routes: Mutex<HashMap<CircuitId, Route>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkDispatcher {
    pub fn new(transport: Arc<TransportMultiplexer>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            routes: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    /// Subscribe to the transport and start routing. No-op if already started.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let events = self.transport.subscribe();
        *task = Some(tokio::spawn(run(Arc::downgrade(self), events)));
        debug!("Link dispatcher started");
    }

    /// Stop routing. Every registered circuit is told the transport is gone.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.broadcast_shutdown();
    }

    /// Reserve a fresh circuit id and its inbox
    pub fn register(&self) -> (CircuitId, mpsc::UnboundedReceiver<CircuitSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        let mut id = CircuitId::random();
        while routes.contains_key(&id) {
            id = CircuitId::random();
        }
        routes.insert(
            id,
            Route {
                link: None,
                inbox: tx,
            },
        );
        (id, rx)
    }

    /// Accept frames for `id` from `link` only
    pub fn bind(&self, id: CircuitId, link: &str) {
        if let Some(route) = self.routes.lock().get_mut(&id) {
            route.link = Some(link.to_string());
        }
    }

    pub fn deregister(&self, id: CircuitId) {
        self.routes.lock().remove(&id);
    }

    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    fn route(&self, link: &str, frame: Frame) {
        let routes = self.routes.lock();
        match routes.get(&frame.circuit_id) {
            Some(route) if route.link.as_deref() == Some(link) => {
                let _ = route.inbox.send(CircuitSignal::Frame(frame));
            }
            _ => trace!(
                "Dropping {:?} frame for unknown circuit {} from {}",
                frame.kind,
                frame.circuit_id,
                link
            ),
        }
    }

    /// Ask a circuit to give up whatever it is waiting on
    pub fn close(&self, id: CircuitId) {
        if let Some(route) = self.routes.lock().get(&id) {
            let _ = route.inbox.send(CircuitSignal::Close);
        }
    }

    /// Tell every circuit bound to `link` that it is gone. Called for peer
    /// hangups and for links closed locally, which the transport does not
    /// report.
    pub fn link_closed(&self, link: &str) {
        let routes = self.routes.lock();
        for route in routes.values() {
            if route.link.as_deref() == Some(link) {
                let _ = route.inbox.send(CircuitSignal::LinkClosed);
            }
        }
    }

    pub fn broadcast_shutdown(&self) {
        let routes = self.routes.lock();
        for route in routes.values() {
            let _ = route.inbox.send(CircuitSignal::Shutdown);
        }
    }
}

async fn run(
    dispatcher: Weak<LinkDispatcher>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut decoders: HashMap<ConnectionId, FrameDecoder> = HashMap::new();

    while let Some(event) = events.recv().await {
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };

        match event {
            TransportEvent::Connected(link) => {
                decoders.insert(link, FrameDecoder::new());
            }
            TransportEvent::Data(link, bytes) => {
                let decoder = decoders.entry(link.clone()).or_default();
                decoder.extend(&bytes);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => dispatcher.route(&link, frame),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Protocol violation on {}: {}, dropping link", link, e);
                            decoders.remove(&link);
                            // Local disconnects produce no event, so notify here
                            dispatcher.transport.disconnect(&link);
                            dispatcher.link_closed(&link);
                            break;
                        }
                    }
                }
            }
            TransportEvent::Disconnected(link) => {
                decoders.remove(&link);
                dispatcher.link_closed(&link);
            }
            TransportEvent::Shutdown => {
                decoders.clear();
                dispatcher.broadcast_shutdown();
            }
        }
    }
    debug!("Link dispatcher exited");
}
