//! Wire framing: message types and the 5-byte per-message header.
//!
//! A datagram carries one or more framed messages back-to-back:
//!
//! ```text
//! +------+-------------------+-------------+------------ variable --+
//! | type | seq<<1 | fragment | payload bits |        payload        |
//! | (1B) |   (2B, LE 15+1)   |  (2B, LE)    |  ceil(bits / 8) bytes  |
//! +------+-------------------+-------------+------------------------+
//! ```

use bytes::BufMut;

use crate::error::{PeerError, Result};

/// Size of the per-message header in bytes.
pub const HEADER_SIZE: usize = 5;

/// Largest payload a 16-bit bit length can describe.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize / 8;

/// Largest datagram size MTU discovery will ever probe.
pub const PROTOCOL_MAX_MTU: usize = MAX_PAYLOAD_SIZE - 1;

/// Number of user message types, one channel slot each.
pub const NUM_CHANNEL_SLOTS: usize = 98;

/// Sequenced and ordered methods expose this many logical channels.
pub const CHANNELS_PER_SEQUENCED_METHOD: u8 = 32;

/// Reliability and ordering applied to a message.
///
/// The discriminant is the first wire message type of the method; the
/// logical channel is added on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMethod {
    Unreliable = 1,
    UnreliableSequenced = 2,
    ReliableUnordered = 34,
    ReliableSequenced = 35,
    ReliableOrdered = 67,
}

impl DeliveryMethod {
    /// Number of logical channels available for this method.
    pub fn channel_count(self) -> u8 {
        match self {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => 1,
            _ => CHANNELS_PER_SEQUENCED_METHOD,
        }
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            DeliveryMethod::UnreliableSequenced | DeliveryMethod::ReliableSequenced
        )
    }

    /// Resolve the method a user message type belongs to.
    pub fn from_message_type(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMethod::Unreliable),
            2..=33 => Some(DeliveryMethod::UnreliableSequenced),
            34 => Some(DeliveryMethod::ReliableUnordered),
            35..=66 => Some(DeliveryMethod::ReliableSequenced),
            67..=98 => Some(DeliveryMethod::ReliableOrdered),
            _ => None,
        }
    }
}

/// Library (control) messages, wire values 128 and up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LibraryMessage {
    Error = 128,
    Ping = 129,
    Pong = 130,
    Connect = 131,
    ConnectResponse = 132,
    ConnectionEstablished = 133,
    Acknowledge = 134,
    Disconnect = 135,
    Discovery = 136,
    DiscoveryResponse = 137,
    NatPunchMessage = 138,
    NatIntroduction = 139,
    ExpandMtuRequest = 140,
    ExpandMtuSuccess = 141,
    NatIntroductionConfirmRequest = 142,
    NatIntroductionConfirmed = 143,
}

impl LibraryMessage {
    /// Connect, ConnectResponse, ConnectionEstablished and Disconnect drive the handshake.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            LibraryMessage::Connect
                | LibraryMessage::ConnectResponse
                | LibraryMessage::ConnectionEstablished
                | LibraryMessage::Disconnect
        )
    }

    pub fn is_nat(self) -> bool {
        matches!(
            self,
            LibraryMessage::NatPunchMessage
                | LibraryMessage::NatIntroduction
                | LibraryMessage::NatIntroductionConfirmRequest
                | LibraryMessage::NatIntroductionConfirmed
        )
    }
}

impl TryFrom<u8> for LibraryMessage {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            128 => Ok(LibraryMessage::Error),
            129 => Ok(LibraryMessage::Ping),
            130 => Ok(LibraryMessage::Pong),
            131 => Ok(LibraryMessage::Connect),
            132 => Ok(LibraryMessage::ConnectResponse),
            133 => Ok(LibraryMessage::ConnectionEstablished),
            134 => Ok(LibraryMessage::Acknowledge),
            135 => Ok(LibraryMessage::Disconnect),
            136 => Ok(LibraryMessage::Discovery),
            137 => Ok(LibraryMessage::DiscoveryResponse),
            138 => Ok(LibraryMessage::NatPunchMessage),
            139 => Ok(LibraryMessage::NatIntroduction),
            140 => Ok(LibraryMessage::ExpandMtuRequest),
            141 => Ok(LibraryMessage::ExpandMtuSuccess),
            142 => Ok(LibraryMessage::NatIntroductionConfirmRequest),
            143 => Ok(LibraryMessage::NatIntroductionConfirmed),
            other => Err(PeerError::UnknownMessageType(other)),
        }
    }
}

/// Decoded wire message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Application data sent outside any connection.
    Unconnected,
    /// Application data on a logical channel of a delivery method.
    User { method: DeliveryMethod, channel: u8 },
    /// Control traffic handled by the library itself.
    Library(LibraryMessage),
}

impl MessageType {
    /// Build a user message type, validating the channel number.
    pub fn user(method: DeliveryMethod, channel: u8) -> Result<Self> {
        if channel >= method.channel_count() {
            return Err(PeerError::InvalidChannel {
                method,
                channel,
                max: method.channel_count() - 1,
            });
        }
        Ok(MessageType::User { method, channel })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Unconnected => 0,
            MessageType::User { method, channel } => method as u8 + channel,
            MessageType::Library(lib) => lib as u8,
        }
    }

    pub fn is_library(self) -> bool {
        matches!(self, MessageType::Library(_))
    }

    /// Index of the channel pair handling this type on a connection.
    pub fn channel_slot(self) -> Option<usize> {
        match self {
            MessageType::User { .. } => Some(self.as_u8() as usize - 1),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Unconnected),
            1..=98 => {
                let method = DeliveryMethod::from_message_type(value)
                    .ok_or(PeerError::UnknownMessageType(value))?;
                Ok(MessageType::User {
                    method,
                    channel: value - method as u8,
                })
            }
            99..=127 => Err(PeerError::UnknownMessageType(value)),
            _ => Ok(MessageType::Library(LibraryMessage::try_from(value)?)),
        }
    }
}

/// The fixed per-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u8,
    pub is_fragment: bool,
    pub sequence: u16,
    pub payload_bits: u16,
}

impl FrameHeader {
    pub fn new(message_type: u8, is_fragment: bool, sequence: u16, payload_len: usize) -> Self {
        debug_assert!(payload_len <= MAX_PAYLOAD_SIZE);
        Self {
            message_type,
            is_fragment,
            sequence,
            payload_bits: (payload_len * 8) as u16,
        }
    }

    /// Payload size in whole bytes.
    pub fn payload_len(&self) -> usize {
        (self.payload_bits as usize).div_ceil(8)
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.message_type);
        buf.put_u8(((self.sequence << 1) | self.is_fragment as u16) as u8);
        buf.put_u8((self.sequence >> 7) as u8);
        buf.put_u16_le(self.payload_bits);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(PeerError::FrameTooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let low = data[1];
        let high = data[2];
        Ok(Self {
            message_type: data[0],
            is_fragment: low & 1 == 1,
            sequence: (low >> 1) as u16 | ((high as u16) << 7),
            payload_bits: u16::from_le_bytes([data[3], data[4]]),
        })
    }
}

/// Write one complete framed message.
pub fn encode_message<B: BufMut>(
    buf: &mut B,
    message_type: u8,
    is_fragment: bool,
    sequence: u16,
    payload: &[u8],
) {
    FrameHeader::new(message_type, is_fragment, sequence, payload.len()).encode_into(buf);
    buf.put_slice(payload);
}

/// One framed message borrowed from a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub message_type: MessageType,
    pub is_fragment: bool,
    pub sequence: u16,
    pub payload: &'a [u8],
}

/// Iterator over the framed messages of a datagram.
///
/// The first error ends the iteration: the rest of the datagram cannot be
/// framed reliably once a header is bad.
pub struct DatagramFrames<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

pub fn parse_datagram(data: &[u8]) -> DatagramFrames<'_> {
    DatagramFrames {
        data,
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for DatagramFrames<'a> {
    type Item = Result<RawFrame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        let result = FrameHeader::decode(rest).and_then(|header| {
            let message_type = MessageType::try_from(header.message_type)?;
            let len = header.payload_len();
            let remaining = rest.len() - HEADER_SIZE;
            if len > remaining {
                return Err(PeerError::MalformedPacket {
                    stated: len,
                    remaining,
                });
            }
            Ok(RawFrame {
                message_type,
                is_fragment: header.is_fragment,
                sequence: header.sequence,
                payload: &rest[HEADER_SIZE..HEADER_SIZE + len],
            })
        });
        match &result {
            Ok(frame) => self.offset += HEADER_SIZE + frame.payload.len(),
            Err(_) => self.done = true,
        }
        Some(result)
    }
}
