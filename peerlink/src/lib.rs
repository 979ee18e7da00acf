//! PeerLink -- peer-to-peer messaging over a single UDP socket.
//!
//! A [`Peer`] owns the socket and a network thread. Each [`Connection`]
//! carries application messages with one of five delivery methods:
//! - **Unreliable**: no acks, no ordering
//! - **UnreliableSequenced**: late messages dropped, 32 channels
//! - **ReliableUnordered**: acked and resent, delivered on arrival
//! - **ReliableSequenced**: acked and resent, only the newest delivered
//! - **ReliableOrdered**: acked, resent and delivered in order

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod message;
pub mod peer;
pub mod pool;
pub mod sequence;
pub mod stats;

// Re-export key public types at crate root.
pub use config::{PeerConfig, UnreliableSizeBehaviour};
pub use connection::mtu::MtuStatus;
pub use connection::{Connection, ConnectionStatus};
pub use error::{PeerError, Result};
pub use frame::{DeliveryMethod, LibraryMessage, MessageType};
pub use message::{IncomingMessage, IncomingMessageType, OutgoingMessage, SendResult};
pub use peer::{NatAction, NatTraversal, Peer, PeerStatus};
pub use pool::{MessagePool, PoolStats};
pub use stats::{ConnectionStatsSnapshot, PeerStatsSnapshot};

pub use peerlink_crypt as crypt;
