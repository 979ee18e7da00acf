use std::net::SocketAddr;

use thiserror::Error;

/// All errors produced by the PeerLink transport.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("peer is not running; call start() first")]
    NotRunning,

    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("malformed packet: payload claims {stated} bytes but only {remaining} remain")]
    MalformedPacket { stated: usize, remaining: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("channel {channel} out of range for {method:?} (max {max})")]
    InvalidChannel {
        method: crate::frame::DeliveryMethod,
        channel: u8,
        max: u8,
    },

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("malformed library message {kind}: {reason}")]
    MalformedLibraryMessage { kind: &'static str, reason: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("encryption error: {0}")]
    Crypt(#[from] peerlink_crypt::CryptError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerError>;
