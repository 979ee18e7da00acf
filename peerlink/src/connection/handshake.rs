//! Connect / ConnectResponse / ConnectionEstablished exchange and approval.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Connection, ConnectionInner, ConnectionStatus};
use crate::error::Result;
use crate::frame::LibraryMessage;
use crate::message::{self, IncomingMessage, IncomingMessageType, PayloadReader};
use crate::peer::NetContext;

pub(crate) const WRONG_APP_REASON: &str = "Wrong application identifier!";

const NO_RESPONSE_REASON: &str = "Failed to establish connection - no response from remote host";

/// Body of Connect and ConnectResponse.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConnectPayload {
    pub(crate) app_identifier: String,
    pub(crate) unique_identifier: u64,
    pub(crate) remote_time: f32,
    pub(crate) hail: Bytes,
}

impl ConnectPayload {
    pub(crate) fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(2 + self.app_identifier.len() + 12 + self.hail.len());
        message::write_string(&mut buf, &self.app_identifier);
        buf.put_u64_le(self.unique_identifier);
        buf.put_f32_le(self.remote_time);
        buf.put_slice(&self.hail);
        buf
    }

    pub(crate) fn decode(kind: &'static str, data: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(data, kind);
        let app_identifier = reader.read_string()?;
        let unique_identifier = reader.read_u64()?;
        let remote_time = reader.read_f32()?;
        Ok(Self {
            app_identifier,
            unique_identifier,
            remote_time,
            hail: Bytes::copy_from_slice(reader.rest()),
        })
    }
}

#[derive(Debug)]
pub(crate) enum ApprovalDecision {
    Approve(Option<Bytes>),
    Deny(String),
}

#[derive(Debug, Default)]
pub(crate) struct Handshake {
    pub(crate) connect_requested: bool,
    pub(crate) attempts: u32,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) local_hail: Option<Bytes>,
    pub(crate) remote_hail: Option<Bytes>,
    pub(crate) awaiting_since: Option<Instant>,
    pub(crate) decision: Option<ApprovalDecision>,
}

impl Connection {
    fn handshake_payload(&self, inner: &ConnectionInner, now: Instant, ctx: &NetContext<'_>) -> BytesMut {
        ConnectPayload {
            app_identifier: self.config.app_identifier.clone(),
            unique_identifier: ctx.unique_identifier,
            remote_time: ctx.local_seconds(now),
            hail: inner.handshake.local_hail.clone().unwrap_or_default(),
        }
        .encode()
    }

    fn record_handshake_send(inner: &mut ConnectionInner, now: Instant) {
        inner.handshake.attempts += 1;
        inner.handshake.last_sent = Some(now);
    }

    pub(super) fn send_connect(self: &Arc<Self>, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let payload = self.handshake_payload(inner, now, ctx);
        let remote = self.remote_endpoint();
        ctx.send_library(remote, LibraryMessage::Connect, &payload);
        inner.handshake.connect_requested = false;
        Self::record_handshake_send(inner, now);
        tracing::debug!(remote = %remote, attempt = inner.handshake.attempts, "sent connect");
        self.set_status(ConnectionStatus::InitiatedConnect, "Locally requested connect", now);
    }

    fn send_connect_response(self: &Arc<Self>, inner: &mut ConnectionInner, now: Instant, ctx: &NetContext<'_>) {
        let payload = self.handshake_payload(inner, now, ctx);
        let remote = self.remote_endpoint();
        ctx.send_library(remote, LibraryMessage::ConnectResponse, &payload);
        Self::record_handshake_send(inner, now);
        tracing::debug!(remote = %remote, attempt = inner.handshake.attempts, "sent connect response");
        self.set_status(ConnectionStatus::RespondedConnect, "Remotely requested connect", now);
    }

    fn send_connection_established(&self, now: Instant, ctx: &NetContext<'_>) {
        let time = ctx.local_seconds(now).to_le_bytes();
        ctx.send_library(self.remote_endpoint(), LibraryMessage::ConnectionEstablished, &time);
    }

    fn store_remote(&self, inner: &mut ConnectionInner, payload: &ConnectPayload, now: Instant, ctx: &NetContext<'_>) {
        self.remote_unique_identifier
            .store(payload.unique_identifier, Ordering::Release);
        inner.handshake.remote_hail = Some(payload.hail.clone());
        inner
            .latency
            .set_remote_time(payload.remote_time, ctx.local_seconds(now));
    }

    /// Step an outstanding handshake: resends, approval decisions, timeouts.
    pub(crate) fn unconnected_heartbeat(self: &Arc<Self>, now: Instant, ctx: &NetContext<'_>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(request) = inner.disconnect.take() {
            self.execute_disconnect(inner, now, &request.reason, request.send_bye, ctx);
            return;
        }

        let status = self.status();
        if inner.handshake.connect_requested {
            match status {
                ConnectionStatus::Connected | ConnectionStatus::RespondedConnect => {
                    tracing::warn!(remote = %self.remote_endpoint(), "connect requested while already connected");
                    inner.handshake.connect_requested = false;
                }
                _ => self.send_connect(inner, now, ctx),
            }
            return;
        }

        match status {
            ConnectionStatus::RespondedAwaitingApproval => {
                if let Some(decision) = inner.handshake.decision.take() {
                    match decision {
                        ApprovalDecision::Approve(hail) => {
                            inner.handshake.local_hail = hail;
                            inner.handshake.attempts = 0;
                            self.send_connect_response(inner, now, ctx);
                        }
                        ApprovalDecision::Deny(reason) => {
                            self.execute_disconnect(inner, now, &reason, true, ctx);
                        }
                    }
                    return;
                }
                let waited = inner
                    .handshake
                    .awaiting_since
                    .map(|since| now.saturating_duration_since(since));
                if waited.is_some_and(|w| w > self.config.connection_timeout) {
                    self.execute_disconnect(inner, now, "Approval timed out", true, ctx);
                }
                return;
            }
            ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {}
            _ => return,
        }

        let due = inner
            .handshake
            .last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.config.resend_handshake_interval);
        if !due {
            return;
        }
        if inner.handshake.attempts >= self.config.maximum_handshake_attempts {
            tracing::debug!(remote = %self.remote_endpoint(), attempts = inner.handshake.attempts, "handshake gave up");
            self.execute_disconnect(inner, now, NO_RESPONSE_REASON, true, ctx);
            return;
        }
        if status == ConnectionStatus::InitiatedConnect {
            self.send_connect(inner, now, ctx);
        } else {
            self.send_connect_response(inner, now, ctx);
        }
    }

    /// An unsolicited Connect already checked by the peer (application id, capacity).
    pub(crate) fn received_connect(self: &Arc<Self>, now: Instant, payload: ConnectPayload, ctx: &NetContext<'_>) {
        let mut guard = self.inner.lock();
        self.accept_connect(&mut guard, now, payload, ctx);
    }

    fn accept_connect(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        now: Instant,
        payload: ConnectPayload,
        ctx: &NetContext<'_>,
    ) {
        self.store_remote(inner, &payload, now, ctx);
        self.set_status(ConnectionStatus::ReceivedInitiation, "Remotely requested connect", now);

        if self.config.is_message_type_enabled(IncomingMessageType::ConnectionApproval) {
            inner.handshake.awaiting_since = Some(now);
            self.set_status(ConnectionStatus::RespondedAwaitingApproval, "Awaiting approval", now);
            let request = IncomingMessage::library(IncomingMessageType::ConnectionApproval, payload.hail, now, None)
                .with_connection(Arc::clone(self));
            self.release(request);
        } else {
            self.send_connect_response(inner, now, ctx);
        }
    }

    /// Handle a handshake-type library message. Returns true when it moved
    /// the connection to `Connected`.
    pub(crate) fn received_handshake(
        self: &Arc<Self>,
        now: Instant,
        kind: LibraryMessage,
        payload: &[u8],
        ctx: &NetContext<'_>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let status = self.status();

        match kind {
            LibraryMessage::Connect => match status {
                ConnectionStatus::RespondedConnect => {
                    // our response was lost
                    self.send_connect_response(inner, now, ctx);
                }
                ConnectionStatus::None | ConnectionStatus::InitiatedConnect => {
                    let connect = ConnectPayload::decode("Connect", payload)?;
                    if connect.app_identifier != self.config.app_identifier {
                        tracing::warn!(remote = %self.remote_endpoint(), "connect with wrong application identifier");
                        let mut reply = BytesMut::with_capacity(2 + WRONG_APP_REASON.len());
                        message::write_string(&mut reply, WRONG_APP_REASON);
                        ctx.send_library(self.remote_endpoint(), LibraryMessage::Disconnect, &reply);
                        return Ok(false);
                    }
                    tracing::debug!(remote = %self.remote_endpoint(), "simultaneous connect, responding");
                    self.accept_connect(inner, now, connect, ctx);
                }
                _ => {}
            },
            LibraryMessage::ConnectResponse => match status {
                // RespondedConnect: both sides connected at once and both answered
                ConnectionStatus::InitiatedConnect | ConnectionStatus::RespondedConnect => {
                    let response = ConnectPayload::decode("ConnectResponse", payload)?;
                    self.store_remote(inner, &response, now, ctx);
                    self.send_connection_established(now, ctx);
                    self.establish(inner, now, ctx);
                    return Ok(true);
                }
                ConnectionStatus::Connected if self.initiator => {
                    // our ConnectionEstablished was lost
                    self.send_connection_established(now, ctx);
                }
                _ => {}
            },
            LibraryMessage::ConnectionEstablished => {
                if status == ConnectionStatus::RespondedConnect {
                    let remote_time = PayloadReader::new(payload, "ConnectionEstablished").read_f32()?;
                    inner.latency.set_remote_time(remote_time, ctx.local_seconds(now));
                    self.establish(inner, now, ctx);
                    return Ok(true);
                }
            }
            LibraryMessage::Disconnect => {
                let reason = PayloadReader::new(payload, "Disconnect").read_string()?;
                self.execute_disconnect(inner, now, &reason, false, ctx);
            }
            _ => {}
        }
        Ok(false)
    }

    /// User data from a responder-side handshake: the ConnectionEstablished
    /// was lost, but the remote clearly considers itself connected.
    pub(crate) fn establish_on_data(self: &Arc<Self>, now: Instant, ctx: &NetContext<'_>) -> bool {
        let mut guard = self.inner.lock();
        if self.status() != ConnectionStatus::RespondedConnect {
            return false;
        }
        self.establish(&mut guard, now, ctx);
        true
    }
}
