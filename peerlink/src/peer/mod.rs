//! The peer: one UDP socket, its network thread and the connection tables.
//!
//! Application threads talk to a [`Peer`] through thread-safe calls that
//! queue work; the network thread owns every read and write on the socket.

mod network;
mod released;
mod socket;
mod unconnected;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::PeerConfig;
use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::frame::{DeliveryMethod, LibraryMessage, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::{IncomingMessage, OutgoingMessage, QueuedMessage, SendResult};
use crate::pool::{MessagePool, PoolStats};
use crate::stats::{PeerStatistics, PeerStatsSnapshot};

pub(crate) use released::ReleasedMessages;
pub(crate) use socket::{NetContext, SendOutcome};

#[cfg(test)]
pub(crate) use socket::test_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
    NotRunning = 0,
    Starting = 1,
    Running = 2,
    ShutdownRequested = 3,
}

impl PeerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PeerStatus::Starting,
            2 => PeerStatus::Running,
            3 => PeerStatus::ShutdownRequested,
            _ => PeerStatus::NotRunning,
        }
    }
}

/// What a [`NatTraversal`] handler wants done with a NAT message.
#[derive(Debug, Clone)]
pub enum NatAction {
    /// Send a library message, typically a punch or an introduction.
    Send {
        target: SocketAddr,
        kind: LibraryMessage,
        payload: Bytes,
    },
    /// Hole punching to `endpoint` worked; released as `NatIntroductionSuccess`.
    IntroductionSucceeded { endpoint: SocketAddr, token: Bytes },
}

/// Handler for NAT introduction and punch-through messages.
///
/// Called on the network thread; must not block.
pub trait NatTraversal: Send + Sync {
    fn on_message(&self, kind: LibraryMessage, from: SocketAddr, payload: &[u8]) -> Vec<NatAction>;
}

/// Connected connections, in insertion order with an endpoint index.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    list: Vec<Arc<Connection>>,
    lookup: HashMap<SocketAddr, Arc<Connection>>,
}

impl ConnectionTable {
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn get(&self, endpoint: &SocketAddr) -> Option<Arc<Connection>> {
        self.lookup.get(endpoint).cloned()
    }

    pub(crate) fn contains(&self, endpoint: &SocketAddr) -> bool {
        self.lookup.contains_key(endpoint)
    }

    pub(crate) fn insert(&mut self, connection: Arc<Connection>) {
        let endpoint = connection.remote_endpoint();
        if self.lookup.insert(endpoint, Arc::clone(&connection)).is_none() {
            self.list.push(connection);
        }
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Arc<Connection> {
        let connection = self.list.remove(index);
        let endpoint = connection.remote_endpoint();
        if self
            .lookup
            .get(&endpoint)
            .is_some_and(|c| Arc::ptr_eq(c, &connection))
        {
            self.lookup.remove(&endpoint);
        }
        connection
    }

    fn rekey(&mut self, old: SocketAddr, new: SocketAddr) {
        if let Some(connection) = self.lookup.remove(&old) {
            self.lookup.insert(new, connection);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.list.clear();
        self.lookup.clear();
    }
}

pub(crate) struct PeerShared {
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) pool: Arc<MessagePool>,
    pub(crate) released: Arc<ReleasedMessages>,
    pub(crate) stats: PeerStatistics,
    pub(crate) flush_requested: Arc<AtomicBool>,
    pub(crate) connections: Mutex<ConnectionTable>,
    pub(crate) handshakes: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    pub(crate) unsent_unconnected: SegQueue<(SocketAddr, Arc<QueuedMessage>)>,
    pub(crate) epoch: Instant,
    status: AtomicU8,
    unique_identifier: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_reason: Mutex<String>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerShared {
    pub(crate) fn status(&self) -> PeerStatus {
        PeerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: PeerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn unique_identifier(&self) -> u64 {
        self.unique_identifier.load(Ordering::Acquire)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
    }

    pub(crate) fn shutdown_reason(&self) -> String {
        self.shutdown_reason.lock().clone()
    }

    pub(crate) fn new_connection(&self, remote: SocketAddr, initiator: bool, now: Instant) -> Arc<Connection> {
        Connection::new(
            remote,
            initiator,
            Arc::clone(&self.config),
            Arc::clone(&self.pool),
            Arc::clone(&self.released),
            Arc::clone(&self.flush_requested),
            now,
        )
    }

    /// Move a finished handshake into the connection table.
    pub(crate) fn accept_connection(&self, connection: &Arc<Connection>) {
        let endpoint = connection.remote_endpoint();
        let mut connections = self.connections.lock();
        let mut handshakes = self.handshakes.lock();
        handshakes.remove(&endpoint);
        if !connections.contains(&endpoint) {
            connections.insert(Arc::clone(connection));
        }
    }

    /// The remote answered from a different port than we sent to (NAT
    /// rewrote it); re-key the connection under its real endpoint.
    pub(crate) fn migrate_endpoint(&self, connection: &Arc<Connection>, new_endpoint: SocketAddr) {
        let old = connection.remote_endpoint();
        if old == new_endpoint {
            return;
        }
        let mut connections = self.connections.lock();
        let mut handshakes = self.handshakes.lock();
        connection.set_remote_endpoint(new_endpoint);
        if let Some(handshake) = handshakes.remove(&old) {
            handshakes.insert(new_endpoint, handshake);
        }
        connections.rekey(old, new_endpoint);
        tracing::debug!(old = %old, new = %new_endpoint, "migrated connection endpoint");
    }

    pub(crate) fn queue_unconnected(&self, target: SocketAddr, message_type: u8, payload: Bytes) -> Result<()> {
        if self.status() != PeerStatus::Running {
            return Err(PeerError::NotRunning);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PeerError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let message = Arc::new(QueuedMessage::new(message_type, false, payload, 1));
        self.unsent_unconnected.push((target, message));
        Ok(())
    }
}

fn node_identifier() -> u64 {
    static NODE_ID: OnceLock<u64> = OnceLock::new();
    *NODE_ID.get_or_init(|| rand::random::<u64>() ^ std::process::id() as u64)
}

/// First 8 bytes of SHA-256 over the bound endpoint and this process's node id.
pub(crate) fn compute_unique_identifier(bound: SocketAddr, node: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(bound.to_string().as_bytes());
    hasher.update(node.to_le_bytes());
    let digest = hasher.finalize();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(id)
}

/// A UDP endpoint that can hold many connections.
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(MessagePool::new(config.max_pooled_buffers));
        let shared = PeerShared {
            config: Arc::new(config),
            pool,
            released: Arc::new(ReleasedMessages::new()),
            stats: PeerStatistics::new(),
            flush_requested: Arc::new(AtomicBool::new(false)),
            connections: Mutex::new(ConnectionTable::default()),
            handshakes: Mutex::new(HashMap::new()),
            unsent_unconnected: SegQueue::new(),
            epoch: Instant::now(),
            status: AtomicU8::new(PeerStatus::NotRunning as u8),
            unique_identifier: AtomicU64::new(0),
            local_addr: Mutex::new(None),
            shutdown_reason: Mutex::new(String::new()),
            thread: Mutex::new(None),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Bind the socket and start the network thread.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.status() != PeerStatus::NotRunning {
            tracing::warn!(status = ?shared.status(), "start called on a peer that is already running");
            return Ok(());
        }
        shared.set_status(PeerStatus::Starting);
        shared.connections.lock().clear();
        shared.handshakes.lock().clear();
        shared.released.clear();
        while shared.unsent_unconnected.pop().is_some() {}

        let bound = socket::bind_socket(&shared.config, shared.config.port, false)
            .and_then(|socket| socket.local_addr().map(|addr| (socket, addr)));
        let (socket, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                shared.set_status(PeerStatus::NotRunning);
                return Err(e.into());
            }
        };
        shared.set_local_addr(local_addr);
        shared
            .unique_identifier
            .store(compute_unique_identifier(local_addr, node_identifier()), Ordering::Release);

        shared.set_status(PeerStatus::Running);
        match network::spawn(Arc::clone(shared), socket) {
            Ok(handle) => {
                *shared.thread.lock() = Some(handle);
            }
            Err(e) => {
                shared.set_status(PeerStatus::NotRunning);
                return Err(e.into());
            }
        }
        tracing::info!(local = %local_addr, app = %shared.config.app_identifier, "peer started");
        Ok(())
    }

    /// Disconnect everything with `reason` and stop the network thread.
    ///
    /// Blocks until the thread has exited unless called from it.
    pub fn shutdown(&self, reason: &str) {
        let shared = &self.shared;
        if shared.status() != PeerStatus::Running {
            return;
        }
        *shared.shutdown_reason.lock() = reason.to_string();
        shared.set_status(PeerStatus::ShutdownRequested);
        tracing::info!(reason, "peer shutdown requested");

        let handle = shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("network thread panicked");
                shared.set_status(PeerStatus::NotRunning);
            }
        }
    }

    pub fn status(&self) -> PeerStatus {
        self.shared.status()
    }

    pub fn configuration(&self) -> &PeerConfig {
        &self.shared.config
    }

    /// Identifier sent in handshakes; zero until started.
    pub fn unique_identifier(&self) -> u64 {
        self.shared.unique_identifier()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn statistics(&self) -> PeerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.lock().list.clone()
    }

    pub fn connections_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn get_connection(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        self.shared.connections.lock().get(&endpoint)
    }

    pub fn create_message(&self) -> OutgoingMessage {
        self.shared.pool.create_message()
    }

    pub fn create_message_with_capacity(&self, capacity: usize) -> OutgoingMessage {
        self.shared.pool.create_message_with_capacity(capacity)
    }

    pub fn connect(&self, endpoint: SocketAddr) -> Result<Arc<Connection>> {
        self.connect_inner(endpoint, None)
    }

    /// Connect, attaching `hail` to the Connect message.
    pub fn connect_with_hail(&self, endpoint: SocketAddr, hail: OutgoingMessage) -> Result<Arc<Connection>> {
        self.connect_inner(endpoint, Some(hail.into_buffer().freeze()))
    }

    fn connect_inner(&self, endpoint: SocketAddr, hail: Option<Bytes>) -> Result<Arc<Connection>> {
        let shared = &self.shared;
        if shared.status() != PeerStatus::Running {
            return Err(PeerError::NotRunning);
        }
        let connections = shared.connections.lock();
        let mut handshakes = shared.handshakes.lock();
        if connections.contains(&endpoint) || handshakes.contains_key(&endpoint) {
            return Err(PeerError::AlreadyConnected(endpoint));
        }
        let connection = shared.new_connection(endpoint, true, Instant::now());
        connection.request_connect(hail);
        handshakes.insert(endpoint, Arc::clone(&connection));
        tracing::debug!(remote = %endpoint, "connect requested");
        Ok(connection)
    }

    pub fn send_message(
        &self,
        message: OutgoingMessage,
        connection: &Arc<Connection>,
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<SendResult> {
        connection.send_message(message, method, channel)
    }

    /// Send one payload to several connections, sharing a single buffer
    /// when it fits every recipient's MTU.
    pub fn send_message_to_many(
        &self,
        message: OutgoingMessage,
        recipients: &[Arc<Connection>],
        method: DeliveryMethod,
        channel: u8,
    ) -> Result<Vec<SendResult>> {
        let message_type = MessageType::user(method, channel)?.as_u8();
        let payload = message.into_buffer().freeze();
        let Some(min_mtu) = recipients.iter().map(|c| c.current_mtu()).min() else {
            self.shared.pool.recycle_bytes(payload);
            return Ok(Vec::new());
        };
        if HEADER_SIZE + payload.len() > min_mtu {
            return recipients
                .iter()
                .map(|c| c.send_payload(payload.clone(), method, channel))
                .collect();
        }
        let shared = Arc::new(QueuedMessage::new(message_type, false, payload, recipients.len() as u32));
        Ok(recipients
            .iter()
            .map(|c| c.enqueue_message(Arc::clone(&shared), method))
            .collect())
    }

    pub fn send_unconnected_message(&self, message: OutgoingMessage, endpoint: SocketAddr) -> Result<()> {
        self.shared
            .queue_unconnected(endpoint, MessageType::Unconnected.as_u8(), message.into_buffer().freeze())
    }

    /// Broadcast a Discovery request on the local subnet.
    pub fn discover_local_peers(&self, port: u16) -> Result<()> {
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        self.shared
            .queue_unconnected(target, LibraryMessage::Discovery as u8, Bytes::new())
    }

    pub fn discover_known_peer(&self, endpoint: SocketAddr) -> Result<()> {
        self.shared
            .queue_unconnected(endpoint, LibraryMessage::Discovery as u8, Bytes::new())
    }

    pub fn send_discovery_response(&self, message: OutgoingMessage, endpoint: SocketAddr) -> Result<()> {
        self.shared.queue_unconnected(
            endpoint,
            LibraryMessage::DiscoveryResponse as u8,
            message.into_buffer().freeze(),
        )
    }

    pub fn read_message(&self) -> Option<IncomingMessage> {
        self.shared.released.pop()
    }

    /// Block for up to `timeout` for the next released message.
    pub fn wait_message(&self, timeout: Duration) -> Option<IncomingMessage> {
        if self.shared.status() == PeerStatus::NotRunning {
            return self.shared.released.pop();
        }
        self.shared.released.wait(timeout)
    }

    /// Send everything queued on the next heartbeat. Needed only when
    /// `auto_flush_send_queue` is off.
    pub fn flush_send_queue(&self) {
        self.shared.flush_requested.store(true, Ordering::Release);
    }

    /// Connections still being negotiated.
    pub fn handshake_count(&self) -> usize {
        self.shared.handshakes.lock().len()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown("Peer dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(PeerConfig::new("unit").with_local_address(IpAddr::from([127, 0, 0, 1]))).unwrap()
    }

    #[test]
    fn unique_identifier_depends_on_endpoint() {
        let a: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        assert_eq!(compute_unique_identifier(a, 7), compute_unique_identifier(a, 7));
        assert_ne!(compute_unique_identifier(a, 7), compute_unique_identifier(b, 7));
        assert_ne!(compute_unique_identifier(a, 7), compute_unique_identifier(a, 8));
    }

    #[test]
    fn operations_require_running() {
        let peer = peer();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(peer.connect(target), Err(PeerError::NotRunning)));
        assert!(matches!(peer.discover_known_peer(target), Err(PeerError::NotRunning)));
        assert!(peer.wait_message(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn start_and_shutdown() {
        let peer = peer();
        peer.start().unwrap();
        assert_eq!(peer.status(), PeerStatus::Running);
        assert_ne!(peer.unique_identifier(), 0);
        // second start is a no-op
        peer.start().unwrap();

        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        peer.connect(target).unwrap();
        assert!(matches!(peer.connect(target), Err(PeerError::AlreadyConnected(_))));

        peer.shutdown("done");
        assert_eq!(peer.status(), PeerStatus::NotRunning);
        assert_eq!(peer.handshake_count(), 0);
        assert!(peer.get_connection(target).is_none());
    }

    #[test]
    fn table_rekey_and_remove() {
        let peer = peer();
        let shared = Arc::clone(&peer.shared);
        let old: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let new: SocketAddr = "10.0.0.1:6000".parse().unwrap();
        let connection = shared.new_connection(old, true, Instant::now());
        shared.handshakes.lock().insert(old, Arc::clone(&connection));

        shared.migrate_endpoint(&connection, new);
        assert_eq!(connection.remote_endpoint(), new);
        assert!(shared.handshakes.lock().contains_key(&new));

        shared.accept_connection(&connection);
        assert!(shared.handshakes.lock().is_empty());
        let mut table = shared.connections.lock();
        assert!(table.contains(&new));
        table.remove_at(0);
        assert_eq!(table.len(), 0);
        assert!(table.get(&new).is_none());
    }
}
