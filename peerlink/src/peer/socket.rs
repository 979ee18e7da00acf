//! UDP socket setup and the send seam used by connections.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Instant;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::PeerConfig;
use crate::frame::{self, LibraryMessage, HEADER_SIZE};
use crate::stats::PeerStatistics;

#[cfg(target_os = "linux")]
const EMSGSIZE: i32 = 90;
#[cfg(all(unix, not(target_os = "linux")))]
const EMSGSIZE: i32 = 40;
#[cfg(windows)]
const EMSGSIZE: i32 = 10040;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Sent,
    ConnectionReset,
    MessageTooLarge,
    Failed,
}

/// Where connection traffic is written. Implemented by the peer's socket
/// and by a recording sink in tests.
pub(crate) trait DatagramSink {
    fn send_datagram(&self, data: &[u8], target: SocketAddr) -> SendOutcome;
}

impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram(&self, data: &[u8], target: SocketAddr) -> SendOutcome {
        match self.try_send_to(data, target) {
            Ok(_) => SendOutcome::Sent,
            Err(e) => classify_send_error(&e, target),
        }
    }
}

fn classify_send_error(e: &io::Error, target: SocketAddr) -> SendOutcome {
    if e.kind() == io::ErrorKind::ConnectionReset {
        tracing::debug!(remote = %target, "connection reset by remote host");
        return SendOutcome::ConnectionReset;
    }
    if e.raw_os_error() == Some(EMSGSIZE) {
        return SendOutcome::MessageTooLarge;
    }
    if e.kind() == io::ErrorKind::WouldBlock {
        tracing::trace!(remote = %target, "socket send buffer full, dropping datagram");
    } else {
        tracing::warn!(remote = %target, error = %e, "failed to send datagram");
    }
    SendOutcome::Failed
}

/// Create the peer socket with the configured buffer sizes.
///
/// `reuse` is set when rebinding so the old port can be taken back.
pub(crate) fn bind_socket(config: &PeerConfig, port: u16, reuse: bool) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(config.local_address, port);
    let domain = match config.local_address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.set_recv_buffer_size(config.receive_buffer_size)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    if domain == Domain::IPV4 {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Network-thread state lent to connections for one heartbeat or receive.
pub(crate) struct NetContext<'a> {
    pub(crate) sink: &'a dyn DatagramSink,
    pub(crate) stats: &'a PeerStatistics,
    pub(crate) unique_identifier: u64,
    pub(crate) epoch: Instant,
    pub(crate) execute_flush: bool,
}

impl NetContext<'_> {
    /// Seconds since the peer started, as carried in handshake and pong payloads.
    pub(crate) fn local_seconds(&self, now: Instant) -> f32 {
        now.saturating_duration_since(self.epoch).as_secs_f32()
    }

    pub(crate) fn send_datagram(&self, data: &[u8], target: SocketAddr, messages: usize) -> SendOutcome {
        let outcome = self.sink.send_datagram(data, target);
        if outcome == SendOutcome::Sent {
            self.stats.packet_sent(data.len(), messages);
            tracing::trace!(remote = %target, len = data.len(), messages, "sent datagram");
        }
        outcome
    }

    /// Send one library message in its own datagram.
    pub(crate) fn send_library(&self, target: SocketAddr, kind: LibraryMessage, payload: &[u8]) -> SendOutcome {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        frame::encode_message(&mut buf, kind as u8, false, 0, payload);
        self.send_datagram(&buf, target, 1)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use parking_lot::Mutex;

    use super::*;

    /// Keeps every datagram instead of sending it.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
        /// Datagrams above this size fail with `MessageTooLarge`.
        pub(crate) max_datagram: Option<usize>,
    }

    impl RecordingSink {
        pub(crate) fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, data: &[u8], target: SocketAddr) -> SendOutcome {
            if self.max_datagram.is_some_and(|max| data.len() > max) {
                return SendOutcome::MessageTooLarge;
            }
            self.sent.lock().push((data.to_vec(), target));
            SendOutcome::Sent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let config = PeerConfig::default().with_local_address(IpAddr::from([127, 0, 0, 1]));
        let socket = bind_socket(&config, 0, false).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn library_message_is_framed() {
        let sink = test_util::RecordingSink::default();
        let stats = PeerStatistics::new();
        let ctx = NetContext {
            sink: &sink,
            stats: &stats,
            unique_identifier: 1,
            epoch: Instant::now(),
            execute_flush: false,
        };
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(ctx.send_library(target, LibraryMessage::Ping, &[7]), SendOutcome::Sent);
        let sent = sink.take();
        assert_eq!(sent[0].0, vec![LibraryMessage::Ping as u8, 0, 0, 8, 0, 7]);
        assert_eq!(stats.snapshot().sent_packets, 1);
    }
}
