//! Peer configuration.
//!
//! A `PeerConfig` is validated and frozen into an `Arc` when the peer is
//! created; changing it afterwards has no effect on a running peer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PeerError, Result};
use crate::frame::{HEADER_SIZE, PROTOCOL_MAX_MTU};
use crate::message::IncomingMessageType;
use crate::peer::NatTraversal;
use crate::sequence;

/// Smallest MTU the connection send buffer can work with.
pub const MIN_MTU: usize = 64;

/// What to do with unreliable messages larger than the current MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreliableSizeBehaviour {
    /// Send as one oversized datagram and let IP fragmentation deal with it.
    IgnoreMtu,
    /// Split into library fragments like reliable traffic.
    NormalFragmentation,
    /// Refuse the send with `SendResult::Dropped`.
    DropAboveMtu,
}

#[derive(Clone)]
pub struct PeerConfig {
    /// Must match between peers for a handshake to succeed.
    pub app_identifier: String,
    pub local_address: IpAddr,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub maximum_connections: usize,
    pub accept_incoming_connections: bool,
    /// Initial datagram size limit, header bytes included.
    pub maximum_transmission_unit: usize,
    pub auto_expand_mtu: bool,
    pub expand_mtu_frequency: Duration,
    pub expand_mtu_fail_attempts: u32,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    pub resend_handshake_interval: Duration,
    pub maximum_handshake_attempts: u32,
    pub auto_flush_send_queue: bool,
    pub suppress_unreliable_unordered_acks: bool,
    pub unreliable_size_behaviour: UnreliableSizeBehaviour,
    /// Window of channels without a dedicated size (reliable unordered).
    pub default_window_size: usize,
    pub max_pooled_buffers: usize,
    pub nat_traversal: Option<Arc<dyn NatTraversal>>,
    enabled_message_types: u32,
}

impl PeerConfig {
    pub fn new(app_identifier: impl Into<String>) -> Self {
        let disabled = IncomingMessageType::ConnectionApproval.bit()
            | IncomingMessageType::UnconnectedData.bit()
            | IncomingMessageType::NatIntroductionSuccess.bit()
            | IncomingMessageType::ConnectionLatencyUpdated.bit();
        Self {
            app_identifier: app_identifier.into(),
            local_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            receive_buffer_size: 131_071,
            send_buffer_size: 131_071,
            maximum_connections: 32,
            accept_incoming_connections: false,
            maximum_transmission_unit: 1408,
            auto_expand_mtu: false,
            expand_mtu_frequency: Duration::from_secs(2),
            expand_mtu_fail_attempts: 5,
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            resend_handshake_interval: Duration::from_secs(3),
            maximum_handshake_attempts: 5,
            auto_flush_send_queue: true,
            suppress_unreliable_unordered_acks: false,
            unreliable_size_behaviour: UnreliableSizeBehaviour::IgnoreMtu,
            default_window_size: sequence::DEFAULT_WINDOW_SIZE,
            max_pooled_buffers: 64,
            nat_traversal: None,
            enabled_message_types: IncomingMessageType::ALL_BITS & !disabled,
        }
    }

    pub fn with_local_address(mut self, address: IpAddr) -> Self {
        self.local_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_accept_incoming_connections(mut self, accept: bool) -> Self {
        self.accept_incoming_connections = accept;
        self
    }

    pub fn with_maximum_connections(mut self, max: usize) -> Self {
        self.maximum_connections = max;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.maximum_transmission_unit = mtu;
        self
    }

    pub fn with_auto_expand_mtu(mut self, enabled: bool) -> Self {
        self.auto_expand_mtu = enabled;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_resend_handshake_interval(mut self, interval: Duration) -> Self {
        self.resend_handshake_interval = interval;
        self
    }

    pub fn with_maximum_handshake_attempts(mut self, attempts: u32) -> Self {
        self.maximum_handshake_attempts = attempts;
        self
    }

    pub fn with_auto_flush_send_queue(mut self, enabled: bool) -> Self {
        self.auto_flush_send_queue = enabled;
        self
    }

    pub fn with_suppress_unreliable_unordered_acks(mut self, suppress: bool) -> Self {
        self.suppress_unreliable_unordered_acks = suppress;
        self
    }

    pub fn with_unreliable_size_behaviour(mut self, behaviour: UnreliableSizeBehaviour) -> Self {
        self.unreliable_size_behaviour = behaviour;
        self
    }

    pub fn with_nat_traversal(mut self, handler: Arc<dyn NatTraversal>) -> Self {
        self.nat_traversal = Some(handler);
        self
    }

    pub fn enable_message_type(mut self, kind: IncomingMessageType) -> Self {
        self.enabled_message_types |= kind.bit();
        self
    }

    pub fn disable_message_type(mut self, kind: IncomingMessageType) -> Self {
        self.enabled_message_types &= !kind.bit();
        self
    }

    /// Data messages are always delivered.
    pub fn is_message_type_enabled(&self, kind: IncomingMessageType) -> bool {
        kind == IncomingMessageType::Data || self.enabled_message_types & kind.bit() != 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_identifier.is_empty() {
            return Err(PeerError::InvalidConfig("app_identifier must not be empty".into()));
        }
        if self.app_identifier.len() > u16::MAX as usize {
            return Err(PeerError::InvalidConfig("app_identifier too long".into()));
        }
        if !(MIN_MTU..=PROTOCOL_MAX_MTU).contains(&self.maximum_transmission_unit) {
            return Err(PeerError::InvalidConfig(format!(
                "maximum_transmission_unit {} outside {}..={}",
                self.maximum_transmission_unit, MIN_MTU, PROTOCOL_MAX_MTU
            )));
        }
        if !sequence::is_valid_window_size(self.default_window_size) {
            return Err(PeerError::InvalidConfig(format!(
                "default_window_size {} must divide {} and be at most half of it",
                self.default_window_size,
                sequence::NUM_SEQUENCE_NUMBERS
            )));
        }
        if self.ping_interval >= self.connection_timeout {
            return Err(PeerError::InvalidConfig(
                "ping_interval must be shorter than connection_timeout".into(),
            ));
        }
        if self.maximum_handshake_attempts == 0 {
            return Err(PeerError::InvalidConfig(
                "maximum_handshake_attempts must be at least 1".into(),
            ));
        }
        if self.receive_buffer_size < HEADER_SIZE || self.send_buffer_size < HEADER_SIZE {
            return Err(PeerError::InvalidConfig("socket buffer sizes too small".into()));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new("peerlink")
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("app_identifier", &self.app_identifier)
            .field("local_address", &self.local_address)
            .field("port", &self.port)
            .field("maximum_connections", &self.maximum_connections)
            .field("accept_incoming_connections", &self.accept_incoming_connections)
            .field("maximum_transmission_unit", &self.maximum_transmission_unit)
            .field("auto_expand_mtu", &self.auto_expand_mtu)
            .field("ping_interval", &self.ping_interval)
            .field("connection_timeout", &self.connection_timeout)
            .field("unreliable_size_behaviour", &self.unreliable_size_behaviour)
            .field("nat_traversal", &self.nat_traversal.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PeerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.maximum_transmission_unit, 1408);
        assert_eq!(config.connection_timeout, Duration::from_secs(25));
        assert!(!config.accept_incoming_connections);
    }

    #[test]
    fn default_message_type_mask() {
        let config = PeerConfig::default();
        assert!(config.is_message_type_enabled(IncomingMessageType::StatusChanged));
        assert!(config.is_message_type_enabled(IncomingMessageType::DiscoveryRequest));
        assert!(!config.is_message_type_enabled(IncomingMessageType::ConnectionApproval));
        assert!(!config.is_message_type_enabled(IncomingMessageType::UnconnectedData));

        let config = config
            .enable_message_type(IncomingMessageType::UnconnectedData)
            .disable_message_type(IncomingMessageType::Data);
        assert!(config.is_message_type_enabled(IncomingMessageType::UnconnectedData));
        assert!(config.is_message_type_enabled(IncomingMessageType::Data));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(PeerConfig::new("").validate().is_err());
        assert!(PeerConfig::default().with_mtu(10).validate().is_err());
        assert!(PeerConfig::default().with_mtu(9000).validate().is_err());
        assert!(PeerConfig::default()
            .with_ping_interval(Duration::from_secs(30))
            .validate()
            .is_err());
        let mut config = PeerConfig::default();
        config.default_window_size = 100;
        assert!(config.validate().is_err());
    }
}
