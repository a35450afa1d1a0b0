//! TCP Transport Multiplexer
//!
//! Owns the listening socket and every live connection. Callers address
//! connections by id and receive [`TransportEvent`]s over unbounded
//! channels, so event delivery never blocks the I/O tasks.
//!
//! Each connection is driven by one task that runs its read and write
//! halves concurrently and races both against the shutdown signal.
//! Outbound bytes are written with `write_all`, so a short write resumes
//! on the next writable notification instead of dropping the remainder.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::TransportConfig;

/// Connection identifier: `host:port` for outbound, peer `ip:port` for inbound
pub type ConnectionId = String;

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established (outbound) or accepted (inbound)
    Connected(ConnectionId),

    /// Connection closed by the peer, failed, or timed out while connecting.
    /// Not emitted for connections closed through [`TransportMultiplexer::disconnect`].
    Disconnected(ConnectionId),

    /// Bytes read from a connection
    Data(ConnectionId, Bytes),

    /// The multiplexer stopped; all connections are gone
    Shutdown,
}

struct ConnectionEntry {
    serial: u64,
    established: bool,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// State shared between the multiplexer handle and its tasks
struct Shared {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_serial: AtomicU64,
    read_buffer_size: usize,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Mark an outbound entry established, unless it was removed meanwhile
    fn mark_established(&self, id: &ConnectionId, serial: u64) -> bool {
        let mut connections = self.connections.lock();
        match connections.get_mut(id) {
            Some(entry) if entry.serial == serial => {
                entry.established = true;
                // Emitted under the map lock so events stay ordered with the map
                self.emit(TransportEvent::Connected(id.clone()));
                true
            }
            _ => false,
        }
    }

    /// Remove the entry if it still belongs to this task, reporting the loss
    fn remove_if_current(&self, id: &ConnectionId, serial: u64) {
        let mut connections = self.connections.lock();
        if connections.get(id).map(|e| e.serial) == Some(serial) {
            connections.remove(id);
            self.emit(TransportEvent::Disconnected(id.clone()));
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Multiplexes many TCP connections behind string ids
pub struct TransportMultiplexer {
    config: TransportConfig,
    bind_addr: Mutex<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
    shared: Arc<Shared>,
}

impl TransportMultiplexer {
    /// Create an idle multiplexer
    pub fn new(config: TransportConfig) -> Self {
        let read_buffer_size = config.read_buffer_size.max(1);
        Self {
            config,
            bind_addr: Mutex::new(None),
            running: Mutex::new(None),
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                next_serial: AtomicU64::new(1),
                read_buffer_size,
            }),
        }
    }

    /// Record the listen address. May be repeated until `start`.
    pub fn initialize(&self, port: u16, bind_address: &str) -> NetworkResult<()> {
        if self.running.lock().is_some() {
            return Err(NetworkError::AlreadyRunning);
        }

        let ip: IpAddr = bind_address.trim().parse().map_err(|_| {
            NetworkError::ConfigError(format!("Invalid bind address: {}", bind_address))
        })?;

        *self.bind_addr.lock() = Some(SocketAddr::new(ip, port));
        debug!("Transport initialized for {}:{}", ip, port);
        Ok(())
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self) -> NetworkResult<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(NetworkError::AlreadyRunning);
        }

        let addr = (*self.bind_addr.lock())
            .ok_or_else(|| NetworkError::ConfigError("Transport not initialized".into()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindError { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start
            return Err(NetworkError::AlreadyRunning);
        }

        let accept_task = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            shutdown_rx,
        ));
        *running = Some(Running {
            shutdown,
            accept_task,
            local_addr,
        });

        info!("Transport listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and join all tasks.
    /// A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        let closed = {
            let mut connections = self.shared.connections.lock();
            let count = connections.len();
            connections.clear();
            count
        };

        let _ = running.accept_task.await;
        let tasks: Vec<JoinHandle<()>> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.shared.emit(TransportEvent::Shutdown);
        info!(
            "Transport on {} stopped, closed {} connections",
            running.local_addr, closed
        );
    }

    /// Whether `start` has been called without a matching `stop`
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound listen address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Open an outbound connection.
    ///
    /// Returns as soon as the address resolves; the outcome arrives later as
    /// `Connected` or `Disconnected`. Bytes sent before the handshake
    /// completes are queued.
    pub async fn connect(&self, host: &str, port: u16) -> NetworkResult<ConnectionId> {
        let id: ConnectionId = format!("{}:{}", host, port);
        if self.shared.connections.lock().contains_key(&id) {
            return Err(NetworkError::AlreadyConnected(id));
        }

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| NetworkError::AddressError(format!("{}: {}", id, e)))?
            .next()
            .ok_or_else(|| NetworkError::AddressError(format!("{}: no addresses", id)))?;

        let shutdown_rx = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.shutdown.subscribe())
            .ok_or(NetworkError::NotRunning)?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = self.shared.connections.lock();
            if connections.contains_key(&id) {
                return Err(NetworkError::AlreadyConnected(id));
            }
            connections.insert(
                id.clone(),
                ConnectionEntry {
                    serial,
                    established: false,
                    outbound,
                },
            );
        }

        let task = tokio::spawn(run_outbound(
            self.shared.clone(),
            id.clone(),
            serial,
            addr,
            self.config.connect_timeout,
            outbound_rx,
            shutdown_rx,
        ));
        self.shared.track(task);

        debug!("Connecting {} ({})", id, addr);
        Ok(id)
    }

    /// Close and forget a connection. Queued writes are flushed first.
    pub fn disconnect(&self, id: &str) {
        // Dropping the sender ends the writer once the queue drains
        if self.shared.connections.lock().remove(id).is_some() {
            debug!("Disconnected {}", id);
        }
    }

    /// Queue bytes for a connection
    pub fn send(&self, id: &str, bytes: Bytes) -> NetworkResult<()> {
        let connections = self.shared.connections.lock();
        let entry = connections
            .get(id)
            .ok_or_else(|| NetworkError::NotConnected(id.to_string()))?;

        trace!("Queueing {} bytes for {}", bytes.len(), id);
        entry
            .outbound
            .send(bytes)
            .map_err(|_| NetworkError::NotConnected(id.to_string()))
    }

    /// Connection exists and its handshake completed
    pub fn is_connected(&self, id: &str) -> bool {
        self.shared
            .connections
            .lock()
            .get(id)
            .map(|e| e.established)
            .unwrap_or(false)
    }

    /// Connection exists, possibly still connecting
    pub fn has_connection(&self, id: &str) -> bool {
        self.shared.connections.lock().contains_key(id)
    }

    /// Ids of every live connection
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.shared.connections.lock().keys().cloned().collect()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Register a new event listener
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }
}

impl Drop for TransportMultiplexer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id: ConnectionId = peer.to_string();
                    let (outbound, outbound_rx) = mpsc::unbounded_channel();
                    let serial = shared.next_serial.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut connections = shared.connections.lock();
                        if connections.contains_key(&id) {
                            warn!("Duplicate inbound connection id {}, dropping", id);
                            continue;
                        }
                        connections.insert(id.clone(), ConnectionEntry {
                            serial,
                            established: true,
                            outbound,
                        });
                        shared.emit(TransportEvent::Connected(id.clone()));
                    }

                    debug!("Accepted connection from {}", id);
                    let task = tokio::spawn(drive_connection(
                        shared.clone(),
                        id,
                        serial,
                        stream,
                        outbound_rx,
                        shutdown_rx.clone(),
                    ));
                    shared.track(task);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
    }
    trace!("Accept loop exited");
}

async fn run_outbound(
    shared: Arc<Shared>,
    id: ConnectionId,
    serial: u64,
    addr: SocketAddr,
    connect_timeout: std::time::Duration,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let attempt = tokio::select! {
        _ = shutdown_rx.changed() => return,
        attempt = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)) => attempt,
    };

    match attempt {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            if !shared.mark_established(&id, serial) {
                // Disconnected locally while the handshake was in flight
                return;
            }
            debug!("Connected to {}", id);
            drive_connection(shared, id, serial, stream, outbound_rx, shutdown_rx).await;
        }
        Ok(Err(e)) => {
            warn!("Connection to {} failed: {}", id, e);
            shared.remove_if_current(&id, serial);
        }
        Err(_) => {
            warn!("Connection to {} timed out", id);
            shared.remove_if_current(&id, serial);
        }
    }
}

/// How the write half of a connection ended
enum WriteEnd {
    /// Queue closed by `disconnect` and fully flushed
    Drained,
    Failed,
}

async fn write_loop(
    id: &str,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) -> WriteEnd {
    while let Some(bytes) = outbound_rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("Write to {} failed: {}", id, e);
            return WriteEnd::Failed;
        }
    }
    let _ = writer.shutdown().await;
    WriteEnd::Drained
}

async fn read_loop(shared: &Shared, id: &ConnectionId, mut reader: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(shared.read_buffer_size);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Peer {} closed the connection", id);
                return;
            }
            Ok(n) => {
                trace!("Read {} bytes from {}", n, id);
                let data = buf.split().freeze();
                shared.emit(TransportEvent::Data(id.clone(), data));
                buf.reserve(shared.read_buffer_size);
            }
            Err(e) => {
                debug!("Read from {} failed: {}", id, e);
                return;
            }
        }
    }
}

/// Runs both halves of a connection side by side, so a peer that stops
/// reading stalls neither our reads nor shutdown.
async fn drive_connection(
    shared: Arc<Shared>,
    id: ConnectionId,
    serial: u64,
    stream: TcpStream,
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();

    tokio::select! {
        _ = shutdown_rx.changed() => return,
        end = write_loop(&id, writer, outbound_rx) => {
            if let WriteEnd::Drained = end {
                // Entry already removed by `disconnect`
                return;
            }
        }
        _ = read_loop(&shared, &id, reader) => {}
    }

    shared.remove_if_current(&id, serial);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn transport() -> TransportMultiplexer {
        TransportMultiplexer::new(TransportConfig::default())
    }

    async fn started() -> (TransportMultiplexer, SocketAddr) {
        let t = transport();
        t.initialize(0, "127.0.0.1").unwrap();
        let addr = t.start().await.unwrap();
        (t, addr)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_initialize_rejects_bad_address() {
        let t = transport();
        assert!(matches!(
            t.initialize(9050, "not-an-ip"),
            Err(NetworkError::ConfigError(_))
        ));
        // Idempotent until start
        t.initialize(9050, "127.0.0.1").unwrap();
        t.initialize(9051, "0.0.0.0").unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (t, _) = started().await;
        assert!(matches!(t.start().await, Err(NetworkError::AlreadyRunning)));
        assert!(matches!(
            t.initialize(0, "127.0.0.1"),
            Err(NetworkError::AlreadyRunning)
        ));
        t.stop().await;
        assert!(!t.is_running());
        // Restart after stop
        t.start().await.unwrap();
        t.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let (first, addr) = started().await;
        let second = transport();
        second.initialize(addr.port(), "127.0.0.1").unwrap();
        assert!(matches!(
            second.start().await,
            Err(NetworkError::BindError { .. })
        ));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let t = transport();
        t.stop().await;
        t.stop().await;
    }

    #[tokio::test]
    async fn test_connect_requires_running() {
        let t = transport();
        assert!(matches!(
            t.connect("127.0.0.1", 1).await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_exchange_and_duplicate_connect() {
        let (server, server_addr) = started().await;
        let (client, _) = started().await;
        let mut server_events = server.subscribe();
        let mut client_events = client.subscribe();

        let id = client.connect("127.0.0.1", server_addr.port()).await.unwrap();
        assert_eq!(id, format!("127.0.0.1:{}", server_addr.port()));
        assert!(matches!(
            client.connect("127.0.0.1", server_addr.port()).await,
            Err(NetworkError::AlreadyConnected(_))
        ));

        // Queued before the handshake completes
        client.send(&id, Bytes::from_static(b"ping")).unwrap();
        assert_eq!(next_event(&mut client_events).await, TransportEvent::Connected(id.clone()));
        assert!(client.is_connected(&id));

        let inbound = match next_event(&mut server_events).await {
            TransportEvent::Connected(inbound) => inbound,
            other => panic!("unexpected event {:?}", other),
        };

        let mut received = Vec::new();
        while received.len() < 4 {
            match next_event(&mut server_events).await {
                TransportEvent::Data(from, data) => {
                    assert_eq!(from, inbound);
                    received.extend_from_slice(&data);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(received, b"ping");

        server.send(&inbound, Bytes::from_static(b"pong")).unwrap();
        match next_event(&mut client_events).await {
            TransportEvent::Data(from, data) => {
                assert_eq!(from, id);
                assert_eq!(&data[..], b"pong");
            }
            other => panic!("unexpected event {:?}", other),
        }

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_large_write_arrives_intact() {
        let (server, server_addr) = started().await;
        let (client, _) = started().await;
        let mut server_events = server.subscribe();

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let id = client.connect("127.0.0.1", server_addr.port()).await.unwrap();
        client.send(&id, Bytes::from(payload.clone())).unwrap();

        let mut received = Vec::with_capacity(payload.len());
        while received.len() < payload.len() {
            if let TransportEvent::Data(_, data) = next_event(&mut server_events).await {
                received.extend_from_slice(&data);
            }
        }
        assert_eq!(received, payload);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_with_stalled_write() {
        // Accepts and then never reads, so the send buffer fills up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let holder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let (client, _) = started().await;
        let mut events = client.subscribe();
        let id = client.connect("127.0.0.1", port).await.unwrap();
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected(id.clone()));

        client.send(&id, Bytes::from(vec![0u8; 64 * 1024 * 1024])).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .expect("stop blocked behind a stalled write");
        assert_eq!(client.connection_count(), 0);
        holder.abort();
    }

    #[tokio::test]
    async fn test_simultaneous_large_writes() {
        let (server, server_addr) = started().await;
        let (client, _) = started().await;
        let mut server_events = server.subscribe();
        let mut client_events = client.subscribe();

        let id = client.connect("127.0.0.1", server_addr.port()).await.unwrap();
        let inbound = match next_event(&mut server_events).await {
            TransportEvent::Connected(inbound) => inbound,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(next_event(&mut client_events).await, TransportEvent::Connected(id.clone()));

        // Both sides write more than the socket buffers hold before reading
        const SIZE: usize = 16 * 1024 * 1024;
        client.send(&id, Bytes::from(vec![1u8; SIZE])).unwrap();
        server.send(&inbound, Bytes::from(vec![2u8; SIZE])).unwrap();

        let mut at_server = 0;
        let mut at_client = 0;
        while at_server < SIZE || at_client < SIZE {
            tokio::select! {
                Some(event) = server_events.recv() => {
                    if let TransportEvent::Data(_, data) = event {
                        assert!(data.iter().all(|b| *b == 1));
                        at_server += data.len();
                    }
                }
                Some(event) = client_events.recv() => {
                    if let TransportEvent::Data(_, data) = event {
                        assert!(data.iter().all(|b| *b == 2));
                        at_client += data.len();
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(10)) => panic!("transfer stalled"),
            }
        }
        assert_eq!(at_server, SIZE);
        assert_eq!(at_client, SIZE);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect() {
        let (server, server_addr) = started().await;
        let (client, _) = started().await;
        let mut server_events = server.subscribe();

        let id = client.connect("127.0.0.1", server_addr.port()).await.unwrap();
        let inbound = match next_event(&mut server_events).await {
            TransportEvent::Connected(inbound) => inbound,
            other => panic!("unexpected event {:?}", other),
        };

        // Local disconnect is silent locally, visible to the peer
        client.disconnect(&id);
        assert!(!client.has_connection(&id));
        assert_eq!(
            next_event(&mut server_events).await,
            TransportEvent::Disconnected(inbound.clone())
        );
        assert!(!server.has_connection(&inbound));

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_refused_connect_reports_disconnect() {
        // Reserve a port, then free it so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (client, _) = started().await;
        let mut events = client.subscribe();
        let id = client.connect("127.0.0.1", port).await.unwrap();

        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected(id.clone()));
        assert!(!client.has_connection(&id));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let (client, _) = started().await;
        assert!(matches!(
            client.connect("no such host.invalid", 80).await,
            Err(NetworkError::AddressError(_))
        ));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let (server, server_addr) = started().await;
        let (client, _) = started().await;
        let mut client_events = client.subscribe();

        let id = client.connect("127.0.0.1", server_addr.port()).await.unwrap();
        assert_eq!(next_event(&mut client_events).await, TransportEvent::Connected(id));

        client.stop().await;
        assert_eq!(client.connection_count(), 0);
        assert_eq!(next_event(&mut client_events).await, TransportEvent::Shutdown);
        assert!(client.send("127.0.0.1:1", Bytes::new()).is_err());

        server.stop().await;
    }
}
