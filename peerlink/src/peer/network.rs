//! The network thread: heartbeat, receive path and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;

use super::socket::{self, NetContext, SendOutcome};
use super::unconnected;
use super::{PeerShared, PeerStatus};
use crate::connection::{Connection, ConnectionStatus};
use crate::error::Result;
use crate::frame::{parse_datagram, LibraryMessage, MessageType, HEADER_SIZE};
use crate::message::IncomingMessage;

static NETWORK_THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Upper bound on one readability wait.
const READ_WAIT: Duration = Duration::from_millis(1);

const MIN_REBIND_INTERVAL: Duration = Duration::from_secs(1);

/// Handshakes are stepped on every third heartbeat frame.
const HANDSHAKE_FRAME_INTERVAL: u64 = 3;

const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) fn spawn(shared: Arc<PeerShared>, socket: std::net::UdpSocket) -> io::Result<JoinHandle<()>> {
    let n = NETWORK_THREAD_COUNT.fetch_add(1, Ordering::Relaxed);
    thread::Builder::new()
        .name(format!("peerlink network thread {n}"))
        .spawn(move || run(shared, socket))
}

fn run(shared: Arc<PeerShared>, socket: std::net::UdpSocket) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build network runtime");
            finish_shutdown(&shared);
            return;
        }
    };
    runtime.block_on(async move {
        match UdpSocket::from_std(socket) {
            Ok(socket) => NetworkLoop::new(shared, socket).run().await,
            Err(e) => {
                tracing::error!(error = %e, "failed to register socket");
                finish_shutdown(&shared);
            }
        }
    });
}

fn finish_shutdown(shared: &PeerShared) {
    shared.connections.lock().clear();
    shared.handshakes.lock().clear();
    while let Some((_, message)) = shared.unsent_unconnected.pop() {
        shared.pool.release(message);
    }
    shared.set_status(PeerStatus::NotRunning);
    shared.released.wake_all();
}

struct NetworkLoop {
    shared: Arc<PeerShared>,
    socket: UdpSocket,
    receive_buffer: Vec<u8>,
    frame_counter: u64,
    last_heartbeat: Option<Instant>,
    last_bind: Instant,
}

impl NetworkLoop {
    fn new(shared: Arc<PeerShared>, socket: UdpSocket) -> Self {
        let size = shared.config.receive_buffer_size.max(RECEIVE_BUFFER_SIZE);
        Self {
            shared,
            socket,
            receive_buffer: vec![0; size],
            frame_counter: 0,
            last_heartbeat: None,
            last_bind: Instant::now(),
        }
    }

    fn ctx(&self, execute_flush: bool) -> NetContext<'_> {
        NetContext {
            sink: &self.socket,
            stats: &self.shared.stats,
            unique_identifier: self.shared.unique_identifier(),
            epoch: self.shared.epoch,
            execute_flush,
        }
    }

    async fn run(mut self) {
        while self.shared.status() == PeerStatus::Running {
            if let Err(e) = self.heartbeat().await {
                tracing::warn!(error = %e, "network heartbeat failed");
            }
        }
        self.shutdown();
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let now = Instant::now();
        let connection_count = self.shared.connections.lock().len();
        let frames_per_second = 1250usize.saturating_sub(connection_count).max(250);
        let frame_interval = Duration::from_secs(1) / frames_per_second as u32;

        if self
            .last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) >= frame_interval)
        {
            self.last_heartbeat = Some(now);
            self.frame_counter += 1;
            self.step_connections(now);
        }

        self.send_unconnected();

        match tokio::time::timeout(READ_WAIT, self.socket.readable()).await {
            Err(_elapsed) => return Ok(()),
            Ok(readable) => readable?,
        }
        self.receive_datagrams()
    }

    fn step_connections(&self, now: Instant) {
        let execute_flush = self.shared.flush_requested.swap(false, Ordering::AcqRel);
        let ctx = self.ctx(execute_flush);

        if self.frame_counter % HANDSHAKE_FRAME_INTERVAL == 0 {
            let handshakes: Vec<Arc<Connection>> = self.shared.handshakes.lock().values().cloned().collect();
            for handshake in &handshakes {
                handshake.unconnected_heartbeat(now, &ctx);
            }
            self.shared
                .handshakes
                .lock()
                .retain(|_, c| c.status() != ConnectionStatus::Disconnected);
        }

        let mut table = self.shared.connections.lock();
        let mut index = table.len();
        while index > 0 {
            index -= 1;
            let connection = Arc::clone(&table.list[index]);
            connection.heartbeat(now, self.frame_counter, &ctx);
            if connection.status() == ConnectionStatus::Disconnected {
                table.remove_at(index);
                tracing::debug!(remote = %connection.remote_endpoint(), "removed disconnected connection");
            }
        }
    }

    fn send_unconnected(&self) {
        let ctx = self.ctx(false);
        while let Some((target, message)) = self.shared.unsent_unconnected.pop() {
            let mut buf = BytesMut::with_capacity(message.encoded_len());
            message.encode_into(0, &mut buf);
            if ctx.send_datagram(&buf, target, 1) == SendOutcome::MessageTooLarge {
                tracing::warn!(remote = %target, len = buf.len(), "unconnected message too large for the path");
            }
            self.shared.pool.release(message);
        }
    }

    fn receive_datagrams(&mut self) -> Result<()> {
        loop {
            match self.socket.try_recv_from(&mut self.receive_buffer) {
                Ok((len, from)) => {
                    let ctx = self.ctx(false);
                    process_datagram(&self.shared, &ctx, Instant::now(), &self.receive_buffer[..len], from);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP port unreachable surfaced on the next read
                    tracing::warn!("connection reset by remote host, ignoring");
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    tracing::warn!(error = %e, "socket lost, rebinding");
                    self.rebind()?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn rebind(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_bind) < MIN_REBIND_INTERVAL {
            return Ok(());
        }
        self.last_bind = now;
        let port = self
            .shared
            .local_addr()
            .map_or(self.shared.config.port, |addr| addr.port());
        let socket = socket::bind_socket(&self.shared.config, port, true)?;
        self.socket = UdpSocket::from_std(socket)?;
        if let Ok(addr) = self.socket.local_addr() {
            self.shared.set_local_addr(addr);
            tracing::info!(local = %addr, "socket rebound");
        }
        Ok(())
    }

    fn shutdown(self) {
        let reason = self.shared.shutdown_reason();
        let now = Instant::now();
        // last heartbeat so queued sends go out ahead of the Disconnect
        self.shared.flush_requested.store(true, Ordering::Release);
        self.step_connections(now);
        {
            let ctx = self.ctx(true);
            let connections = self.shared.connections.lock().list.clone();
            for connection in &connections {
                connection.shutdown(&reason, now, &ctx);
            }
            let handshakes: Vec<Arc<Connection>> = self.shared.handshakes.lock().values().cloned().collect();
            for handshake in &handshakes {
                handshake.shutdown(&reason, now, &ctx);
            }
            self.send_unconnected();
        }
        let shared = Arc::clone(&self.shared);
        drop(self);
        finish_shutdown(&shared);
        tracing::info!(reason = %reason, "peer shut down");
    }
}

/// Parse and dispatch every message of one datagram.
pub(crate) fn process_datagram(shared: &PeerShared, ctx: &NetContext<'_>, now: Instant, data: &[u8], from: SocketAddr) {
    shared.stats.packet_received(data.len());
    if data.len() < HEADER_SIZE {
        shared.stats.malformed_packet();
        tracing::warn!(remote = %from, len = data.len(), "datagram shorter than a message header");
        return;
    }

    let mut sender = shared.connections.lock().get(&from);
    if let Some(connection) = &sender {
        connection.record_packet_received(data.len());
    }

    for frame in parse_datagram(data) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                shared.stats.malformed_packet();
                tracing::warn!(remote = %from, error = %e, "malformed datagram, dropping the rest");
                return;
            }
        };
        shared.stats.message_received(frame.is_fragment);

        match frame.message_type {
            MessageType::Library(kind) => {
                if received_library(shared, ctx, now, sender.as_ref(), from, kind, frame.payload) {
                    sender = shared.connections.lock().get(&from);
                }
            }
            MessageType::Unconnected => {
                unconnected::received_unconnected_data(shared, now, from, frame.payload);
            }
            MessageType::User { .. } => {
                let message = IncomingMessage::data(
                    frame.message_type,
                    frame.sequence,
                    frame.is_fragment,
                    Bytes::copy_from_slice(frame.payload),
                    now,
                );
                if let Some(connection) = &sender {
                    connection.received_message(message);
                    continue;
                }
                let handshake = shared.handshakes.lock().get(&from).cloned();
                if let Some(handshake) = handshake {
                    if handshake.establish_on_data(now, ctx) {
                        shared.accept_connection(&handshake);
                        handshake.received_message(message);
                        sender = Some(handshake);
                        continue;
                    }
                }
                unconnected::received_unconnected_data(shared, now, from, frame.payload);
            }
        }
    }
}

/// Returns true when a handshake completed and `from` is now connected.
fn received_library(
    shared: &PeerShared,
    ctx: &NetContext<'_>,
    now: Instant,
    sender: Option<&Arc<Connection>>,
    from: SocketAddr,
    kind: LibraryMessage,
    payload: &[u8],
) -> bool {
    let peer_level = matches!(kind, LibraryMessage::Discovery | LibraryMessage::DiscoveryResponse) || kind.is_nat();
    if peer_level {
        return unconnected::received_unconnected_library(shared, ctx, now, from, kind, payload);
    }

    if let Some(connection) = sender {
        if let Err(e) = connection.received_library_message(now, kind, payload, ctx) {
            tracing::warn!(remote = %from, ?kind, error = %e, "dropping malformed library message");
        }
        return false;
    }

    let handshake = shared.handshakes.lock().get(&from).cloned();
    if let Some(handshake) = handshake {
        if !kind.is_handshake() {
            tracing::trace!(remote = %from, ?kind, "ignoring library message during handshake");
            return false;
        }
        return match handshake.received_handshake(now, kind, payload, ctx) {
            Ok(true) => {
                shared.accept_connection(&handshake);
                true
            }
            Ok(false) => {
                if handshake.status() == ConnectionStatus::Disconnected {
                    shared.handshakes.lock().remove(&from);
                }
                false
            }
            Err(e) => {
                tracing::warn!(remote = %from, ?kind, error = %e, "dropping malformed handshake message");
                false
            }
        };
    }

    unconnected::received_unconnected_library(shared, ctx, now, from, kind, payload)
}


#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use bytes::BytesMut;

    use super::*;
    use crate::config::PeerConfig;
    use crate::connection::handshake::ConnectPayload;
    use crate::frame::encode_message;
    use crate::message::{IncomingMessageType, PayloadReader};
    use crate::peer::test_util::RecordingSink;
    use crate::peer::Peer;

    fn peer(config: PeerConfig) -> Peer {
        Peer::new(config.with_local_address(IpAddr::from([127, 0, 0, 1]))).unwrap()
    }

    fn ctx<'a>(peer: &'a Peer, sink: &'a RecordingSink) -> NetContext<'a> {
        NetContext {
            sink,
            stats: &peer.shared.stats,
            unique_identifier: 42,
            epoch: peer.shared.epoch,
            execute_flush: false,
        }
    }

    fn connect_datagram(app: &str) -> Vec<u8> {
        let payload = ConnectPayload {
            app_identifier: app.into(),
            unique_identifier: 7,
            remote_time: 1.0,
            hail: Bytes::new(),
        }
        .encode();
        let mut buf = BytesMut::new();
        encode_message(&mut buf, LibraryMessage::Connect as u8, false, 0, &payload);
        buf.to_vec()
    }

    fn disconnect_reason(datagram: &[u8]) -> String {
        assert_eq!(datagram[0], LibraryMessage::Disconnect as u8);
        PayloadReader::new(&datagram[HEADER_SIZE..], "Disconnect")
            .read_string()
            .unwrap()
    }

    // ----------------------------------------------------------------------

    #[test]
    fn short_datagram_is_malformed() {
        let peer = peer(PeerConfig::new("app"));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &[1, 2], from);

        let stats = peer.statistics();
        assert_eq!(stats.received_packets, 1);
        assert_eq!(stats.malformed_packets, 1);
        assert_eq!(stats.received_messages, 0);
    }

    #[test]
    fn bad_header_drops_rest_of_datagram() {
        let peer = peer(PeerConfig::new("app").enable_message_type(IncomingMessageType::UnconnectedData));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut buf = BytesMut::new();
        encode_message(&mut buf, 0, false, 0, b"first");
        encode_message(&mut buf, 120, false, 0, b"bad type");
        encode_message(&mut buf, 0, false, 0, b"never");
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &buf, from);

        let first = peer.read_message().unwrap();
        assert_eq!(first.kind(), IncomingMessageType::UnconnectedData);
        assert_eq!(first.payload().as_ref(), b"first");
        assert_eq!(first.sender_endpoint(), Some(from));
        assert!(peer.read_message().is_none());
        assert_eq!(peer.statistics().malformed_packets, 1);
    }

    #[test]
    fn unconnected_data_dropped_unless_enabled() {
        let peer = peer(PeerConfig::new("app"));
        let sink = RecordingSink::default();
        let mut buf = BytesMut::new();
        encode_message(&mut buf, 0, false, 0, b"hello");
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &buf, from);
        assert!(peer.read_message().is_none());
    }

    #[test]
    fn incoming_connect_creates_handshake() {
        let peer = peer(PeerConfig::new("app").with_accept_incoming_connections(true));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &connect_datagram("app"), from);

        assert_eq!(peer.handshake_count(), 1);
        let handshake = peer.shared.handshakes.lock().get(&from).cloned().unwrap();
        assert_eq!(handshake.status(), ConnectionStatus::RespondedConnect);
        assert_eq!(handshake.remote_unique_identifier(), 7);
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0[0], LibraryMessage::ConnectResponse as u8);
        assert_eq!(sent[0].1, from);
    }

    #[test]
    fn connect_refused_when_not_accepting() {
        let peer = peer(PeerConfig::new("app"));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &connect_datagram("app"), from);
        assert_eq!(peer.handshake_count(), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn connect_with_wrong_app_is_disconnected() {
        let peer = peer(PeerConfig::new("app").with_accept_incoming_connections(true));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &connect_datagram("other"), from);

        assert_eq!(peer.handshake_count(), 0);
        let sent = sink.take();
        assert_eq!(disconnect_reason(&sent[0].0), "Wrong application identifier!");
    }

    #[test]
    fn connect_refused_when_full() {
        let peer = peer(
            PeerConfig::new("app")
                .with_accept_incoming_connections(true)
                .with_maximum_connections(1),
        );
        let sink = RecordingSink::default();
        let first: SocketAddr = "127.0.0.1:4003".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:4004".parse().unwrap();
        let ctx = ctx(&peer, &sink);
        process_datagram(&peer.shared, &ctx, Instant::now(), &connect_datagram("app"), first);
        sink.take();
        process_datagram(&peer.shared, &ctx, Instant::now(), &connect_datagram("app"), second);

        assert_eq!(peer.handshake_count(), 1);
        let sent = sink.take();
        assert_eq!(sent[0].1, second);
        assert_eq!(disconnect_reason(&sent[0].0), "Server full");
    }

    #[test]
    fn established_handshake_moves_to_connections() {
        let peer = peer(PeerConfig::new("app").with_accept_incoming_connections(true));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4005".parse().unwrap();
        let ctx = ctx(&peer, &sink);
        process_datagram(&peer.shared, &ctx, Instant::now(), &connect_datagram("app"), from);

        let mut buf = BytesMut::new();
        encode_message(&mut buf, LibraryMessage::ConnectionEstablished as u8, false, 0, &2.0f32.to_le_bytes());
        process_datagram(&peer.shared, &ctx, Instant::now(), &buf, from);

        assert_eq!(peer.handshake_count(), 0);
        let connection = peer.get_connection(from).unwrap();
        assert_eq!(connection.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn user_data_completes_lost_establishment() {
        let peer = peer(PeerConfig::new("app").with_accept_incoming_connections(true));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4006".parse().unwrap();
        let ctx = ctx(&peer, &sink);
        process_datagram(&peer.shared, &ctx, Instant::now(), &connect_datagram("app"), from);

        let mut buf = BytesMut::new();
        encode_message(&mut buf, 1, false, 0, b"data");
        process_datagram(&peer.shared, &ctx, Instant::now(), &buf, from);

        let connection = peer.get_connection(from).unwrap();
        assert_eq!(connection.status(), ConnectionStatus::Connected);
        let data = std::iter::from_fn(|| peer.read_message())
            .find(|m| m.kind() == IncomingMessageType::Data)
            .unwrap();
        assert_eq!(data.payload().as_ref(), b"data");
    }

    #[test]
    fn discovery_request_released() {
        let peer = peer(PeerConfig::new("app"));
        let sink = RecordingSink::default();
        let from: SocketAddr = "127.0.0.1:4007".parse().unwrap();
        let mut buf = BytesMut::new();
        encode_message(&mut buf, LibraryMessage::Discovery as u8, false, 0, &[]);
        process_datagram(&peer.shared, &ctx(&peer, &sink), Instant::now(), &buf, from);

        let request = peer.read_message().unwrap();
        assert_eq!(request.kind(), IncomingMessageType::DiscoveryRequest);
        assert_eq!(request.sender_endpoint(), Some(from));
    }
}
