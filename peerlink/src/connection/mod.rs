//! A connection to one remote peer.
//!
//! `Connection` is shared between the network thread, which drives its
//! heartbeat and feeds it received messages, and application threads,
//! which enqueue sends. Channel state lives behind one mutex; status, MTU
//! and RTT are mirrored in atomics so they can be read without it.

pub mod handshake;
mod latency;
pub mod mtu;

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};

use crate::channel::{self, Ack, Delivery, OutgoingFrame, ReceiverChannel, SenderChannel};
use crate::config::{PeerConfig, UnreliableSizeBehaviour};
use crate::error::{PeerError, Result};
use crate::fragment::{self, FragmentAssembler, MAX_FRAGMENTED_SIZE};
use crate::frame::{
    DeliveryMethod, FrameHeader, LibraryMessage, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    NUM_CHANNEL_SLOTS,
};
use crate::message::{self, IncomingMessage, IncomingMessageType, OutgoingMessage, PayloadReader, QueuedMessage, SendResult};
use crate::peer::{NetContext, ReleasedMessages, SendOutcome};
use crate::pool::MessagePool;
use crate::stats::{ConnectionStatistics, ConnectionStatsSnapshot};

use handshake::{ApprovalDecision, Handshake};
use latency::Latency;
use mtu::MtuDiscovery;

/// Timeouts and pings are checked on every third heartbeat.
pub(crate) const INFREQUENT_EVENTS_SKIP_FRAMES: u64 = 3;

/// Message type (u8) plus sequence (u16).
const ACK_SIZE: usize = 3;

const MAX_FRAGMENT_GROUP: u32 = 65_534;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    None = 0,
    InitiatedConnect = 1,
    ReceivedInitiation = 2,
    RespondedAwaitingApproval = 3,
    RespondedConnect = 4,
    Connected = 5,
    Disconnecting = 6,
    Disconnected = 7,
}

impl ConnectionStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ConnectionStatus::None,
            1 => ConnectionStatus::InitiatedConnect,
            2 => ConnectionStatus::ReceivedInitiation,
            3 => ConnectionStatus::RespondedAwaitingApproval,
            4 => ConnectionStatus::RespondedConnect,
            5 => ConnectionStatus::Connected,
            6 => ConnectionStatus::Disconnecting,
            7 => ConnectionStatus::Disconnected,
            _ => return None,
        })
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct DisconnectRequest {
    reason: String,
    send_bye: bool,
}

pub(crate) struct ConnectionInner {
    senders: Vec<Option<Box<dyn SenderChannel>>>,
    receivers: Vec<Option<Box<dyn ReceiverChannel>>>,
    outgoing_acks: VecDeque<Ack>,
    incoming_acks: VecDeque<Ack>,
    ack_scratch: Vec<Ack>,
    frames: Vec<OutgoingFrame>,
    send_buffer: BytesMut,
    send_buffer_messages: usize,
    handshake: Handshake,
    latency: Latency,
    mtu: MtuDiscovery,
    fragments: FragmentAssembler,
    last_fragment_group: u32,
    disconnect: Option<DisconnectRequest>,
    timeout_deadline: Instant,
}

impl ConnectionInner {
    fn new(config: &PeerConfig, now: Instant) -> Self {
        Self {
            senders: (0..NUM_CHANNEL_SLOTS).map(|_| None).collect(),
            receivers: (0..NUM_CHANNEL_SLOTS).map(|_| None).collect(),
            outgoing_acks: VecDeque::new(),
            incoming_acks: VecDeque::new(),
            ack_scratch: Vec::new(),
            frames: Vec::new(),
            send_buffer: BytesMut::with_capacity(config.maximum_transmission_unit),
            send_buffer_messages: 0,
            handshake: Handshake::default(),
            latency: Latency::new(now),
            mtu: MtuDiscovery::new(config, now, Duration::ZERO),
            fragments: FragmentAssembler::with_max_age(config.connection_timeout),
            last_fragment_group: 0,
            disconnect: None,
            timeout_deadline: now + config.connection_timeout,
        }
    }

    fn next_fragment_group(&mut self) -> u32 {
        self.last_fragment_group = self.last_fragment_group % MAX_FRAGMENT_GROUP + 1;
        self.last_fragment_group
    }
}

pub struct Connection {
    remote: RwLock<SocketAddr>,
    status: AtomicU8,
    initiator: bool,
    remote_unique_identifier: AtomicU64,
    current_mtu: AtomicUsize,
    /// Average round trip in microseconds; zero until the first pong.
    average_rtt_micros: AtomicU64,
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,
    released: Arc<ReleasedMessages>,
    flush_requested: Arc<AtomicBool>,
    stats: ConnectionStatistics,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        remote: SocketAddr,
        initiator: bool,
        config: Arc<PeerConfig>,
        pool: Arc<MessagePool>,
        released: Arc<ReleasedMessages>,
        flush_requested: Arc<AtomicBool>,
        now: Instant,
    ) -> Arc<Self> {
        let inner = ConnectionInner::new(&config, now);
        Arc::new(Self {
            remote: RwLock::new(remote),
            status: AtomicU8::new(ConnectionStatus::None as u8),
            initiator,
            remote_unique_identifier: AtomicU64::new(0),
            current_mtu: AtomicUsize::new(config.maximum_transmission_unit),
            average_rtt_micros: AtomicU64::new(0),
            config,
            pool,
            released,
            flush_requested,
            stats: ConnectionStatistics::new(),
            inner: Mutex::new(inner),
        })
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        *self.remote.read()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(ConnectionStatus::None)
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn current_mtu(&self) -> usize {
        self.current_mtu.load(Ordering::Acquire)
    }

    pub fn average_round_trip_time(&self) -> Option<Duration> {
        match self.average_rtt_micros.load(Ordering::Acquire) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn remote_unique_identifier(&self) -> u64 {
        self.remote_unique_identifier.load(Ordering::Acquire)
    }

    /// Hail bytes the remote attached to its Connect or ConnectResponse.
    pub fn remote_hail(&self) -> Option<Bytes> {
        self.inner.lock().handshake.remote_hail.clone()
    }

    /// Remote clock minus local clock, in seconds.
    pub fn remote_time_offset(&self) -> f64 {
        self.inner.lock().latency.remote_time_offset()
    }

    pub fn statistics(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn record_packet_received(&self, len: usize) {
        self.stats.packet_received(len);
    }

    pub(crate) fn set_remote_endpoint(&self, endpoint: SocketAddr) {
        *self.remote.write() = endpoint;
    }

    /// Move to `status` and release a StatusChanged message. Disconnected
    /// is terminal.
    pub(crate) fn set_status(self: &Arc<Self>, status: ConnectionStatus, reason: &str, now: Instant) {
        let mut previous = self.status.load(Ordering::Acquire);
        loop {
            if previous == status as u8 || previous == ConnectionStatus::Disconnected as u8 {
                return;
            }
            match self
                .status
                .compare_exchange_weak(previous, status as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => previous = actual,
            }
        }
        tracing::debug!(remote = %self.remote_endpoint(), %status, reason, "connection status changed");
        if status == ConnectionStatus::Connected {
            tracing::info!(remote = %self.remote_endpoint(), "connection established");
        }
        self.release(IncomingMessage::status_changed(status, reason, now, Arc::clone(self)));
    }

    fn release(&self, message: IncomingMessage) {
        if self.config.is_message_type_enabled(message.kind()) {
            self.released.push(message);
        }
    }

    pub(crate) fn request_connect(&self, hail: Option<Bytes>) {
        let mut inner = self.inner.lock();
        inner.handshake.local_hail = hail;
        inner.handshake.connect_requested = true;
    }

    // ---------------------------------------------------------------
    // Application API
    // ---------------------------------------------------------------

    pub fn send_message(&self, message: OutgoingMessage, method: DeliveryMethod, channel: u8) -> Result<SendResult> {
        self.send_payload(message.into_buffer().freeze(), method, channel)
    }

    pub(crate) fn send_payload(&self, payload: Bytes, method: DeliveryMethod, channel: u8) -> Result<SendResult> {
        let message_type = MessageType::user(method, channel)?.as_u8();
        if self.status() != ConnectionStatus::Connected {
            self.pool.recycle_bytes(payload);
            return Ok(SendResult::FailedNotConnected);
        }

        let mtu = self.current_mtu();
        if HEADER_SIZE + payload.len() > mtu && self.can_fragment(method) {
            return self.send_fragmented(payload, message_type, method, mtu);
        }
        let limit = if method.is_sequenced() {
            mtu - HEADER_SIZE
        } else {
            MAX_PAYLOAD_SIZE
        };
        if payload.len() > limit {
            return Err(PeerError::PayloadTooLarge {
                size: payload.len(),
                max: limit,
            });
        }

        let message = Arc::new(QueuedMessage::new(message_type, false, payload, 1));
        let mut inner = self.inner.lock();
        Ok(self.enqueue_locked(&mut inner, message, method))
    }

    fn can_fragment(&self, method: DeliveryMethod) -> bool {
        match method {
            DeliveryMethod::ReliableOrdered | DeliveryMethod::ReliableUnordered => true,
            DeliveryMethod::Unreliable => {
                self.config.unreliable_size_behaviour == UnreliableSizeBehaviour::NormalFragmentation
            }
            _ => false,
        }
    }

    fn send_fragmented(&self, payload: Bytes, message_type: u8, method: DeliveryMethod, mtu: usize) -> Result<SendResult> {
        if payload.len() > MAX_FRAGMENTED_SIZE {
            return Err(PeerError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_FRAGMENTED_SIZE,
            });
        }
        let mut inner = self.inner.lock();
        let group = inner.next_fragment_group();
        let chunks = fragment::split(group, &payload, mtu);
        tracing::trace!(group, chunks = chunks.len(), len = payload.len(), "fragmenting message");

        let mut result = SendResult::Sent;
        for chunk in chunks {
            let message = Arc::new(QueuedMessage::new(message_type, true, chunk, 1));
            result = match (result, self.enqueue_locked(&mut inner, message, method)) {
                (SendResult::Dropped, _) | (_, SendResult::Dropped) => SendResult::Dropped,
                (SendResult::Queued, _) | (_, SendResult::Queued) => SendResult::Queued,
                (r, _) => r,
            };
        }
        drop(inner);
        self.pool.recycle_bytes(payload);
        Ok(result)
    }

    /// Enqueue a message that already carries one recycle reference for
    /// this connection.
    pub(crate) fn enqueue_message(&self, message: Arc<QueuedMessage>, method: DeliveryMethod) -> SendResult {
        if self.status() != ConnectionStatus::Connected {
            self.pool.release(message);
            return SendResult::FailedNotConnected;
        }
        let mut inner = self.inner.lock();
        self.enqueue_locked(&mut inner, message, method)
    }

    fn enqueue_locked(&self, inner: &mut ConnectionInner, message: Arc<QueuedMessage>, method: DeliveryMethod) -> SendResult {
        let slot = message.message_type() as usize - 1;
        let sender = inner.senders[slot].get_or_insert_with(|| channel::create_sender(method, &self.config));
        let result = sender.enqueue(message, self.current_mtu(), &self.pool);
        if self.config.auto_flush_send_queue {
            self.flush_requested.store(true, Ordering::Release);
        }
        result
    }

    /// Ask the network thread to disconnect, sending `reason` to the remote.
    pub fn disconnect(self: &Arc<Self>, reason: &str) {
        match self.status() {
            ConnectionStatus::None | ConnectionStatus::Disconnected => return,
            _ => {}
        }
        // the network thread takes the request under the same lock
        let mut inner = self.inner.lock();
        inner.disconnect = Some(DisconnectRequest {
            reason: reason.to_string(),
            send_bye: true,
        });
        self.set_status(ConnectionStatus::Disconnecting, reason, Instant::now());
    }

    /// Accept a connection waiting for approval.
    pub fn approve(&self) -> Result<()> {
        self.decide(ApprovalDecision::Approve(None))
    }

    pub fn approve_with_hail(&self, hail: OutgoingMessage) -> Result<()> {
        self.decide(ApprovalDecision::Approve(Some(hail.into_buffer().freeze())))
    }

    pub fn deny(&self, reason: &str) -> Result<()> {
        self.decide(ApprovalDecision::Deny(reason.to_string()))
    }

    fn decide(&self, decision: ApprovalDecision) -> Result<()> {
        let status = self.status();
        if status != ConnectionStatus::RespondedAwaitingApproval {
            return Err(PeerError::InvalidStateTransition {
                from: status.to_string(),
                to: format!("{decision:?}"),
            });
        }
        self.inner.lock().handshake.decision = Some(decision);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Network thread
    // ---------------------------------------------------------------

    pub(crate) fn heartbeat(self: &Arc<Self>, now: Instant, frame: u64, ctx: &NetContext<'_>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(request) = inner.disconnect.take() {
            self.execute_disconnect(inner, now, &request.reason, request.send_bye, ctx);
            return;
        }
        if self.status() != ConnectionStatus::Connected {
            return;
        }

        if frame % INFREQUENT_EVENTS_SKIP_FRAMES == 0 {
            if now > inner.timeout_deadline {
                self.execute_disconnect(inner, now, "Connection timed out", true, ctx);
                return;
            }
            if inner.latency.ping_due(now) {
                self.send_ping(inner, now, ctx);
            }
            self.mtu_heartbeat(inner, now, ctx);
            inner.fragments.evict_stale(now);
        }

        self.flush_acks(inner, ctx);
        self.process_incoming_acks(inner, now, ctx);

        if ctx.execute_flush {
            let resend_delay = inner.latency.resend_delay();
            let mut frames = std::mem::take(&mut inner.frames);
            for slot in (0..NUM_CHANNEL_SLOTS).rev() {
                if let Some(sender) = inner.senders[slot].as_mut() {
                    sender.send_queued_messages(now, resend_delay, &mut frames);
                    if sender.need_to_send_messages() {
                        self.flush_requested.store(true, Ordering::Release);
                    }
                }
                for frame in frames.drain(..) {
                    self.write_frame(inner, frame, ctx);
                }
            }
            inner.frames = frames;
        }

        self.flush_send_buffer(inner, ctx);
    }

    /// Disconnect immediately, as on peer shutdown.
    pub(crate) fn shutdown(self: &Arc<Self>, reason: &str, now: Instant, ctx: &NetContext<'_>) {
        let mut guard = self.inner.lock();
        self.execute_disconnect(&mut guard, now, reason, true, ctx);
    }

    fn execute_disconnect(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        now: Instant,
        reason: &str,
        send_bye: bool,
        ctx: &NetContext<'_>,
    ) {
        if self.status() == ConnectionStatus::Disconnected {
            return;
        }
        self.flush_send_buffer(inner, ctx);
        for sender in inner.senders.iter_mut().flatten() {
            sender.reset(&self.pool);
        }
        inner.outgoing_acks.clear();
        inner.incoming_acks.clear();
        inner.fragments.clear();
        inner.disconnect = None;

        if send_bye {
            let mut payload = BytesMut::with_capacity(2 + reason.len());
            message::write_string(&mut payload, reason);
            ctx.send_library(self.remote_endpoint(), LibraryMessage::Disconnect, &payload);
        }
        self.set_status(ConnectionStatus::Disconnected, reason, now);
    }

    fn establish(self: &Arc<Self>, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let rtt = inner.latency.average_rtt().unwrap_or_default();
        inner.mtu = MtuDiscovery::new(&self.config, now, rtt);
        self.current_mtu.store(inner.mtu.current(), Ordering::Release);
        inner.timeout_deadline = now + self.config.connection_timeout * 2;
        inner.latency.initialize(now, self.config.ping_interval);
        self.set_status(ConnectionStatus::Connected, "Connected", now);
        self.send_ping(inner, now, ctx);
    }

    fn send_ping(&self, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let number = inner.latency.next_ping(now, self.config.ping_interval);
        ctx.send_library(self.remote_endpoint(), LibraryMessage::Ping, &[number]);
    }

    fn mtu_heartbeat(&self, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let remote = self.remote_endpoint();
        inner.mtu.heartbeat(now, &mut |size| send_mtu_probe(ctx, remote, size));
        self.current_mtu.store(inner.mtu.current(), Ordering::Release);
    }

    fn flush_acks(&self, inner: &mut ConnectionInner, ctx: &NetContext<'_>) {
        let mtu = self.current_mtu();
        while !inner.outgoing_acks.is_empty() {
            let room = mtu.saturating_sub(inner.send_buffer.len() + HEADER_SIZE) / ACK_SIZE;
            if room == 0 {
                if inner.send_buffer_messages == 0 {
                    tracing::error!(mtu, "mtu too small to carry acknowledgements");
                    inner.outgoing_acks.clear();
                    return;
                }
                self.flush_send_buffer(inner, ctx);
                continue;
            }
            let count = room.min(inner.outgoing_acks.len());
            FrameHeader::new(LibraryMessage::Acknowledge as u8, false, 0, count * ACK_SIZE)
                .encode_into(&mut inner.send_buffer);
            for ack in inner.outgoing_acks.drain(..count) {
                inner.send_buffer.put_u8(ack.message_type);
                inner.send_buffer.put_u16_le(ack.sequence);
            }
            inner.send_buffer_messages += 1;
            if !inner.outgoing_acks.is_empty() {
                self.flush_send_buffer(inner, ctx);
            }
        }
    }

    fn process_incoming_acks(&self, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let resend_delay = inner.latency.resend_delay();
        while let Some(ack) = inner.incoming_acks.pop_front() {
            let slot = ack.message_type as usize;
            let sender = match slot.checked_sub(1).and_then(|s| inner.senders.get_mut(s)) {
                Some(Some(sender)) => sender,
                _ => {
                    tracing::debug!(message_type = ack.message_type, seq = ack.sequence, "ack for unused channel");
                    continue;
                }
            };
            let fresh = sender.receive_acknowledge(now, ack.sequence, resend_delay, &self.pool, &mut inner.frames);
            if fresh {
                inner.timeout_deadline = now + self.config.connection_timeout;
            }
            let mut frames = std::mem::take(&mut inner.frames);
            for frame in frames.drain(..) {
                self.write_frame(inner, frame, ctx);
            }
            inner.frames = frames;
        }
    }

    fn write_frame(&self, inner: &mut ConnectionInner, frame: OutgoingFrame, ctx: &NetContext<'_>) {
        let len = frame.message.encoded_len();
        if inner.send_buffer_messages > 0 && inner.send_buffer.len() + len > self.current_mtu() {
            self.flush_send_buffer(inner, ctx);
        }
        frame.message.encode_into(frame.sequence, &mut inner.send_buffer);
        inner.send_buffer_messages += 1;
        if let Some(reason) = frame.resend {
            self.stats.message_resent(reason);
        }
        self.pool.release(frame.message);
    }

    fn flush_send_buffer(&self, inner: &mut ConnectionInner, ctx: &NetContext<'_>) {
        if inner.send_buffer_messages == 0 {
            return;
        }
        let remote = self.remote_endpoint();
        match ctx.send_datagram(&inner.send_buffer, remote, inner.send_buffer_messages) {
            SendOutcome::Sent => self
                .stats
                .packet_sent(inner.send_buffer.len(), inner.send_buffer_messages),
            SendOutcome::MessageTooLarge => {
                tracing::warn!(remote = %remote, len = inner.send_buffer.len(), "datagram larger than path mtu dropped");
            }
            SendOutcome::ConnectionReset | SendOutcome::Failed => {}
        }
        inner.send_buffer.clear();
        inner.send_buffer_messages = 0;
    }

    /// Library message from the remote of this connection.
    pub(crate) fn received_library_message(
        self: &Arc<Self>,
        now: Instant,
        kind: LibraryMessage,
        payload: &[u8],
        ctx: &NetContext<'_>,
    ) -> Result<bool> {
        if kind.is_handshake() {
            return self.received_handshake(now, kind, payload, ctx);
        }
        let remote = self.remote_endpoint();
        match kind {
            LibraryMessage::Acknowledge => {
                if payload.len() % ACK_SIZE != 0 {
                    return Err(PeerError::MalformedLibraryMessage {
                        kind: "Acknowledge",
                        reason: format!("{} bytes is not a whole number of acks", payload.len()),
                    });
                }
                let mut inner = self.inner.lock();
                for ack in payload.chunks_exact(ACK_SIZE) {
                    inner.incoming_acks.push_back(Ack {
                        message_type: ack[0],
                        sequence: u16::from_le_bytes([ack[1], ack[2]]),
                    });
                }
            }
            LibraryMessage::Ping => {
                let number = PayloadReader::new(payload, "Ping").read_u8()?;
                let mut pong = [0u8; 5];
                pong[0] = number;
                pong[1..].copy_from_slice(&ctx.local_seconds(now).to_le_bytes());
                ctx.send_library(remote, LibraryMessage::Pong, &pong);
            }
            LibraryMessage::Pong => {
                let mut reader = PayloadReader::new(payload, "Pong");
                let number = reader.read_u8()?;
                let remote_time = reader.read_f32()?;
                self.received_pong(now, number, remote_time, ctx);
            }
            LibraryMessage::ExpandMtuRequest => {
                let size = (payload.len() + HEADER_SIZE) as u32;
                ctx.send_library(remote, LibraryMessage::ExpandMtuSuccess, &size.to_le_bytes());
            }
            LibraryMessage::ExpandMtuSuccess => {
                let size = PayloadReader::new(payload, "ExpandMtuSuccess").read_u32()? as usize;
                let mut inner = self.inner.lock();
                inner
                    .mtu
                    .on_success(now, size, &mut |probe| send_mtu_probe(ctx, remote, probe));
                self.current_mtu.store(inner.mtu.current(), Ordering::Release);
            }
            LibraryMessage::Error => {
                tracing::warn!(remote = %remote, len = payload.len(), "remote reported a library error");
            }
            other => {
                tracing::trace!(remote = %remote, kind = ?other, "unhandled library message on connection");
            }
        }
        Ok(false)
    }

    fn received_pong(self: &Arc<Self>, now: Instant, number: u8, remote_time: f32, ctx: &NetContext<'_>) {
        let mut inner = self.inner.lock();
        if inner
            .latency
            .on_pong(now, number, remote_time, ctx.local_seconds(now))
            .is_none()
        {
            return;
        }
        inner.timeout_deadline = now + self.config.connection_timeout;
        let Some(average) = inner.latency.average_rtt() else {
            return;
        };
        drop(inner);

        self.average_rtt_micros
            .store((average.as_micros() as u64).max(1), Ordering::Release);
        let payload = Bytes::copy_from_slice(&average.as_secs_f32().to_le_bytes());
        self.release(
            IncomingMessage::library(IncomingMessageType::ConnectionLatencyUpdated, payload, now, None)
                .with_connection(Arc::clone(self)),
        );
    }

    /// User message from the remote of this connection.
    pub(crate) fn received_message(self: &Arc<Self>, message: IncomingMessage) {
        self.stats.message_received();
        let (Some(slot), Some(method)) = (message.message_type().channel_slot(), message.delivery_method()) else {
            return;
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let receiver = inner.receivers[slot].get_or_insert_with(|| channel::create_receiver(method, &self.config));
        let delivery = receiver.receive(message, &mut inner.ack_scratch);
        inner.outgoing_acks.extend(inner.ack_scratch.drain(..));

        match delivery {
            Delivery::Released(messages) => {
                for message in messages {
                    self.release_data(inner, message);
                }
            }
            Delivery::Withheld => {}
            Delivery::Dropped(reason) => {
                self.stats.message_dropped();
                tracing::trace!(remote = %self.remote_endpoint(), ?reason, "dropped incoming message");
            }
        }
    }

    fn release_data(self: &Arc<Self>, inner: &mut ConnectionInner, message: IncomingMessage) {
        if !message.is_fragment() {
            self.release(message.with_connection(Arc::clone(self)));
            return;
        }
        match inner.fragments.insert(message.received_at(), message.payload()) {
            Ok(Some(whole)) => self.release(message.with_payload(whole).with_connection(Arc::clone(self))),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(remote = %self.remote_endpoint(), error = %e, "dropping bad fragment");
            }
        }
    }
}

fn send_mtu_probe(ctx: &NetContext<'_>, remote: SocketAddr, size: usize) -> bool {
    let padding = vec![0u8; size.saturating_sub(HEADER_SIZE)];
    ctx.send_library(remote, LibraryMessage::ExpandMtuRequest, &padding) != SendOutcome::MessageTooLarge
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote_endpoint())
            .field("status", &self.status())
            .field("initiator", &self.initiator)
            .field("current_mtu", &self.current_mtu())
            .finish()
    }
}
