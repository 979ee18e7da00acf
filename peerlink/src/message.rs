//! Outgoing and incoming message representations.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use peerlink_crypt::MessageEncryption;

use crate::connection::{Connection, ConnectionStatus};
use crate::error::{PeerError, Result};
use crate::frame::{self, DeliveryMethod, MessageType};

/// Outcome of handing a message to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The connection is not in a state to carry application data.
    FailedNotConnected,
    /// Within the window; goes out on the next flush.
    Sent,
    /// Waiting for window space.
    Queued,
    /// Refused by the channel (unreliable window full or above MTU).
    Dropped,
}

/// What an incoming message represents to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IncomingMessageType {
    StatusChanged = 0,
    UnconnectedData = 1,
    ConnectionApproval = 2,
    Data = 3,
    DiscoveryRequest = 4,
    DiscoveryResponse = 5,
    NatIntroductionSuccess = 6,
    ConnectionLatencyUpdated = 7,
}

impl IncomingMessageType {
    pub(crate) const ALL_BITS: u32 = 0xff;

    pub(crate) fn bit(self) -> u32 {
        1 << self as u8
    }
}

/// Application-side builder for a message payload.
///
/// Obtained from [`crate::Peer::create_message`] so the buffer comes from
/// the peer's pool.
#[derive(Debug, Default)]
pub struct OutgoingMessage {
    buf: BytesMut,
}

impl OutgoingMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Direct access for `BufMut`-style writers.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    /// Length-prefixed (u16) UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> &mut Self {
        write_string(&mut self.buf, s);
        self
    }

    /// Replace the payload with its encrypted form.
    pub fn encrypt(&mut self, encryption: &dyn MessageEncryption) -> Result<()> {
        let sealed = encryption.encrypt(&self.buf)?;
        self.buf.clear();
        self.buf.put_slice(&sealed);
        Ok(())
    }

    pub(crate) fn into_buffer(self) -> BytesMut {
        self.buf
    }
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&bytes[..len]);
}

/// A frozen message shared between the send queue, window slots and
/// every connection it was broadcast to.
///
/// `recycle_count` tracks how many of those holders still need it; the
/// pool takes the buffer back when the count drops to zero.
pub struct QueuedMessage {
    message_type: u8,
    is_fragment: bool,
    payload: Bytes,
    recycle_count: AtomicU32,
}

impl QueuedMessage {
    pub fn new(message_type: u8, is_fragment: bool, payload: Bytes, holders: u32) -> Self {
        Self {
            message_type,
            is_fragment,
            payload,
            recycle_count: AtomicU32::new(holders),
        }
    }

    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    pub fn is_fragment(&self) -> bool {
        self.is_fragment
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encoded_len(&self) -> usize {
        frame::HEADER_SIZE + self.payload.len()
    }

    pub fn recycle_count(&self) -> u32 {
        self.recycle_count.load(Ordering::Acquire)
    }

    pub fn encode_into(&self, sequence: u16, buf: &mut BytesMut) {
        frame::encode_message(buf, self.message_type, self.is_fragment, sequence, &self.payload);
    }

    pub(crate) fn retain(&self) {
        self.recycle_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one holder; true when it was the last.
    pub(crate) fn release_ref(&self) -> bool {
        let prev = self.recycle_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "recycle count underflow");
        prev == 1
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl fmt::Debug for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("message_type", &self.message_type)
            .field("is_fragment", &self.is_fragment)
            .field("len", &self.payload.len())
            .field("recycle_count", &self.recycle_count())
            .finish()
    }
}

/// A message released to the application.
#[derive(Clone)]
pub struct IncomingMessage {
    kind: IncomingMessageType,
    message_type: MessageType,
    sequence: u16,
    is_fragment: bool,
    payload: Bytes,
    received_at: Instant,
    sender_endpoint: Option<SocketAddr>,
    sender_connection: Option<Arc<Connection>>,
}

impl IncomingMessage {
    pub(crate) fn data(
        message_type: MessageType,
        sequence: u16,
        is_fragment: bool,
        payload: Bytes,
        received_at: Instant,
    ) -> Self {
        Self {
            kind: IncomingMessageType::Data,
            message_type,
            sequence,
            is_fragment,
            payload,
            received_at,
            sender_endpoint: None,
            sender_connection: None,
        }
    }

    pub(crate) fn library(
        kind: IncomingMessageType,
        payload: Bytes,
        received_at: Instant,
        sender_endpoint: Option<SocketAddr>,
    ) -> Self {
        Self {
            kind,
            message_type: MessageType::Unconnected,
            sequence: 0,
            is_fragment: false,
            payload,
            received_at,
            sender_endpoint,
            sender_connection: None,
        }
    }

    pub(crate) fn status_changed(
        status: ConnectionStatus,
        reason: &str,
        received_at: Instant,
        connection: Arc<Connection>,
    ) -> Self {
        let mut buf = BytesMut::with_capacity(3 + reason.len());
        buf.put_u8(status as u8);
        write_string(&mut buf, reason);
        let endpoint = connection.remote_endpoint();
        Self::library(
            IncomingMessageType::StatusChanged,
            buf.freeze(),
            received_at,
            Some(endpoint),
        )
        .with_connection(connection)
    }

    pub(crate) fn with_connection(mut self, connection: Arc<Connection>) -> Self {
        self.sender_endpoint = Some(connection.remote_endpoint());
        self.sender_connection = Some(connection);
        self
    }

    pub(crate) fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self.is_fragment = false;
        self
    }

    pub fn kind(&self) -> IncomingMessageType {
        self.kind
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn delivery_method(&self) -> Option<DeliveryMethod> {
        match self.message_type {
            MessageType::User { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<u8> {
        match self.message_type {
            MessageType::User { channel, .. } => Some(channel),
            _ => None,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn is_fragment(&self) -> bool {
        self.is_fragment
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn sender_endpoint(&self) -> Option<SocketAddr> {
        self.sender_endpoint
    }

    pub fn sender_connection(&self) -> Option<&Arc<Connection>> {
        self.sender_connection.as_ref()
    }

    /// Status and reason carried by a `StatusChanged` message.
    pub fn status_change(&self) -> Option<(ConnectionStatus, String)> {
        if self.kind != IncomingMessageType::StatusChanged {
            return None;
        }
        let mut reader = PayloadReader::new(&self.payload, "StatusChanged");
        let status = ConnectionStatus::from_u8(reader.read_u8().ok()?)?;
        let reason = reader.read_string().ok()?;
        Some((status, reason))
    }

    /// Replace the payload with its decrypted form.
    pub fn decrypt(&mut self, encryption: &dyn MessageEncryption) -> Result<()> {
        let opened = encryption.decrypt(&self.payload)?;
        self.payload = Bytes::from(opened);
        Ok(())
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .field("sequence", &self.sequence)
            .field("is_fragment", &self.is_fragment)
            .field("len", &self.payload.len())
            .field("sender_endpoint", &self.sender_endpoint)
            .finish()
    }
}

/// Bounds-checked little-endian reader over a library payload.
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    kind: &'static str,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8], kind: &'static str) -> Self {
        Self { data, kind }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(PeerError::MalformedLibraryMessage {
                kind: self.kind,
                reason: format!("needed {n} bytes, {} left", self.data.len()),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| PeerError::MalformedLibraryMessage {
            kind: self.kind,
            reason: format!("invalid utf-8: {e}"),
        })
    }

    pub(crate) fn rest(self) -> &'a [u8] {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_count_tracks_holders() {
        let msg = QueuedMessage::new(1, false, Bytes::from_static(b"x"), 1);
        msg.retain();
        assert_eq!(msg.recycle_count(), 2);
        assert!(!msg.release_ref());
        assert!(msg.release_ref());
        assert_eq!(msg.recycle_count(), 0);
    }

    #[test]
    fn outgoing_writers_are_little_endian() {
        let mut msg = OutgoingMessage::new();
        msg.write_u16(0x0102).write_u32(7).write_string("hi");
        assert_eq!(msg.as_bytes(), &[0x02, 0x01, 7, 0, 0, 0, 2, 0, b'h', b'i']);
    }

    #[test]
    fn payload_reader_round_trip_and_bounds() {
        let mut msg = OutgoingMessage::new();
        msg.write_string("app").write_u64(42).write_f32(1.5).write(b"tail");
        let buf = msg.into_buffer();
        let mut reader = PayloadReader::new(&buf, "Connect");
        assert_eq!(reader.read_string().unwrap(), "app");
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.rest(), b"tail");

        let mut short = PayloadReader::new(&[1, 0], "Pong");
        assert!(short.read_u32().is_err());
    }

    #[test]
    fn status_change_only_for_status_messages() {
        let msg = IncomingMessage::library(
            IncomingMessageType::DiscoveryRequest,
            Bytes::new(),
            Instant::now(),
            None,
        );
        assert!(msg.status_change().is_none());
    }
}
