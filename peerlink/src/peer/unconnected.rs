//! Traffic from endpoints without a connection: unconnected data,
//! discovery, NAT messages and new connect requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::socket::NetContext;
use super::{NatAction, PeerShared};
use crate::connection::handshake::{ConnectPayload, WRONG_APP_REASON};
use crate::connection::{Connection, ConnectionStatus};
use crate::frame::LibraryMessage;
use crate::message::{self, IncomingMessage, IncomingMessageType};

const SERVER_FULL_REASON: &str = "Server full";

pub(crate) fn received_unconnected_data(shared: &PeerShared, now: Instant, from: SocketAddr, payload: &[u8]) {
    if !shared.config.is_message_type_enabled(IncomingMessageType::UnconnectedData) {
        tracing::trace!(remote = %from, "dropping unconnected data");
        return;
    }
    shared.released.push(IncomingMessage::library(
        IncomingMessageType::UnconnectedData,
        Bytes::copy_from_slice(payload),
        now,
        Some(from),
    ));
}

/// Returns true when the message completed a handshake.
pub(crate) fn received_unconnected_library(
    shared: &PeerShared,
    ctx: &NetContext<'_>,
    now: Instant,
    from: SocketAddr,
    kind: LibraryMessage,
    payload: &[u8],
) -> bool {
    match kind {
        LibraryMessage::Discovery => {
            release_if_enabled(shared, IncomingMessageType::DiscoveryRequest, now, from, payload);
        }
        LibraryMessage::DiscoveryResponse => {
            release_if_enabled(shared, IncomingMessageType::DiscoveryResponse, now, from, payload);
        }
        kind if kind.is_nat() => received_nat(shared, ctx, now, from, kind, payload),
        LibraryMessage::Connect => received_connect(shared, ctx, now, from, payload),
        LibraryMessage::ConnectResponse => return received_migrated_response(shared, ctx, now, from, payload),
        other => {
            tracing::trace!(remote = %from, kind = ?other, "ignoring library message from unknown endpoint");
        }
    }
    false
}

fn release_if_enabled(shared: &PeerShared, kind: IncomingMessageType, now: Instant, from: SocketAddr, payload: &[u8]) {
    if shared.config.is_message_type_enabled(kind) {
        shared
            .released
            .push(IncomingMessage::library(kind, Bytes::copy_from_slice(payload), now, Some(from)));
    }
}

fn received_nat(
    shared: &PeerShared,
    ctx: &NetContext<'_>,
    now: Instant,
    from: SocketAddr,
    kind: LibraryMessage,
    payload: &[u8],
) {
    let Some(handler) = &shared.config.nat_traversal else {
        tracing::trace!(remote = %from, ?kind, "no NAT traversal handler installed");
        return;
    };
    for action in handler.on_message(kind, from, payload) {
        match action {
            NatAction::Send { target, kind, payload } => {
                ctx.send_library(target, kind, &payload);
            }
            NatAction::IntroductionSucceeded { endpoint, token } => {
                release_if_enabled(shared, IncomingMessageType::NatIntroductionSuccess, now, endpoint, &token);
            }
        }
    }
}

fn send_disconnect(ctx: &NetContext<'_>, target: SocketAddr, reason: &str) {
    let mut buf = BytesMut::with_capacity(2 + reason.len());
    message::write_string(&mut buf, reason);
    ctx.send_library(target, LibraryMessage::Disconnect, &buf);
}

fn received_connect(shared: &PeerShared, ctx: &NetContext<'_>, now: Instant, from: SocketAddr, payload: &[u8]) {
    if !shared.config.accept_incoming_connections {
        tracing::warn!(remote = %from, "connect received but incoming connections are not accepted");
        return;
    }
    let connect = match ConnectPayload::decode("Connect", payload) {
        Ok(connect) => connect,
        Err(e) => {
            tracing::warn!(remote = %from, error = %e, "malformed connect");
            return;
        }
    };
    if connect.app_identifier != shared.config.app_identifier {
        tracing::warn!(remote = %from, app = %connect.app_identifier, "connect with wrong application identifier");
        send_disconnect(ctx, from, WRONG_APP_REASON);
        return;
    }

    let connection = {
        let connections = shared.connections.lock();
        let mut handshakes = shared.handshakes.lock();
        if connections.len() + handshakes.len() >= shared.config.maximum_connections {
            drop(handshakes);
            drop(connections);
            tracing::debug!(remote = %from, "refusing connect, server full");
            send_disconnect(ctx, from, SERVER_FULL_REASON);
            return;
        }
        let connection = shared.new_connection(from, false, now);
        handshakes.insert(from, Arc::clone(&connection));
        connection
    };
    tracing::debug!(remote = %from, "accepted connect");
    connection.received_connect(now, connect, ctx);
}

/// A ConnectResponse from an endpoint we never sent to: the remote's NAT
/// changed its port. Match it to our pending connect on the same address.
fn received_migrated_response(
    shared: &PeerShared,
    ctx: &NetContext<'_>,
    now: Instant,
    from: SocketAddr,
    payload: &[u8],
) -> bool {
    let candidate: Option<Arc<Connection>> = shared
        .handshakes
        .lock()
        .values()
        .find(|c| {
            c.is_initiator()
                && c.status() == ConnectionStatus::InitiatedConnect
                && c.remote_endpoint().ip() == from.ip()
        })
        .cloned();
    let Some(connection) = candidate else {
        tracing::trace!(remote = %from, "connect response from unknown endpoint");
        return false;
    };

    shared.migrate_endpoint(&connection, from);
    match connection.received_handshake(now, LibraryMessage::ConnectResponse, payload, ctx) {
        Ok(true) => {
            shared.accept_connection(&connection);
            true
        }
        Ok(false) => false,
        Err(e) => {
            tracing::warn!(remote = %from, error = %e, "malformed connect response");
            false
        }
    }
}
