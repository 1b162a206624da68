//! Appliance message layer.
//!
//! Inside the encrypted envelope every appliance speaks the same 10-byte
//! header dialect: `0xAA`, a length byte, the appliance type, five reserved
//! zeros, the device protocol version, and the message type, followed by a
//! type-specific body and an 8-bit two's-complement checksum over everything
//! after the `0xAA`.

use std::fmt;

use crate::core::crypto;
use crate::error::{constants, LanError, Result};

/// Header length in bytes.
pub const HEADER_LEN: usize = 10;

/// Longest body a message can carry; the length at header byte 1 is a single
/// byte covering header, body, and checksum.
pub const MAX_BODY_LEN: usize = u8::MAX as usize - HEADER_LEN - 1;

/// Body of the appliance-capability query: 19 zero bytes.
const QUERY_APPLIANCE_BODY: [u8; 19] = [0; 19];

/// Message type tags observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Set = 0x02,
    Query = 0x03,
    Notify1 = 0x04,
    Notify2 = 0x05,
    Exception = 0x06,
    Exception2 = 0x0A,
    QueryAppliance = 0xA0,
}

impl MessageType {
    /// Map a wire byte onto a known message type.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(MessageType::Set),
            0x03 => Some(MessageType::Query),
            0x04 => Some(MessageType::Notify1),
            0x05 => Some(MessageType::Notify2),
            0x06 => Some(MessageType::Exception),
            0x0A => Some(MessageType::Exception2),
            0xA0 => Some(MessageType::QueryAppliance),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Set => "SET",
            MessageType::Query => "QUERY",
            MessageType::Notify1 => "NOTIFY1",
            MessageType::Notify2 => "NOTIFY2",
            MessageType::Exception => "EXCEPTION",
            MessageType::Exception2 => "EXCEPTION2",
            MessageType::QueryAppliance => "QUERY_APPLIANCE",
        };
        f.write_str(name)
    }
}

/// One appliance request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceMessage {
    pub appliance_type: u8,
    /// Device protocol version from header byte 8.
    pub protocol_version: u8,
    /// Raw message type byte; unknown values pass through untouched.
    pub message_type: u8,
    pub body: Vec<u8>,
}

impl ApplianceMessage {
    pub fn new(appliance_type: u8, protocol_version: u8, message_type: u8, body: Vec<u8>) -> Self {
        Self {
            appliance_type,
            protocol_version,
            message_type,
            body,
        }
    }

    /// The capability query every refresh cycle starts with. Its reply
    /// reveals the device protocol version in header byte 8.
    pub fn query_appliance(appliance_type: u8, protocol_version: u8) -> Self {
        Self::new(
            appliance_type,
            protocol_version,
            MessageType::QueryAppliance as u8,
            QUERY_APPLIANCE_BODY.to_vec(),
        )
    }

    /// Known message type, if this message carries one.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_byte(self.message_type)
    }

    /// Serialize: header, body, trailing checksum.
    ///
    /// # Errors
    /// `LanError::Framing` when the body does not fit the one-byte length
    /// header; truncating it would put a lying length on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(LanError::Framing(constants::ERR_OVERSIZED_MESSAGE));
        }

        let total = HEADER_LEN + self.body.len() + 1;
        let mut out = Vec::with_capacity(total);
        out.push(0xAA);
        out.push(total as u8);
        out.push(self.appliance_type);
        out.extend_from_slice(&[0x00; 5]);
        out.push(self.protocol_version);
        out.push(self.message_type);
        out.extend_from_slice(&self.body);
        out.push(crypto::sum8(&out[1..]));
        Ok(out)
    }

    /// Parse and verify a serialized message.
    ///
    /// # Errors
    /// `LanError::Framing` for anything shorter than 11 bytes or without the
    /// `0xAA` lead byte; `LanError::Integrity` on a checksum mismatch.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN + 1 {
            return Err(LanError::Framing(constants::ERR_SHORT_MESSAGE));
        }
        if raw[0] != 0xAA {
            return Err(LanError::Framing(constants::ERR_BAD_MESSAGE_MAGIC));
        }

        let checksum = raw[raw.len() - 1];
        if crypto::sum8(&raw[1..raw.len() - 1]) != checksum {
            return Err(LanError::Integrity(constants::ERR_MESSAGE_CHECKSUM));
        }

        Ok(Self {
            appliance_type: raw[2],
            protocol_version: raw[8],
            message_type: raw[9],
            body: raw[HEADER_LEN..raw.len() - 1].to_vec(),
        })
    }

    /// Stable identifier for the unsupported-query set: the message type in
    /// the high byte and the leading body byte (the body-type tag, when the
    /// appliance dialect has one) in the low byte.
    pub fn query_id(&self) -> u16 {
        let body_type = self.body.first().copied().unwrap_or(0);
        u16::from(self.message_type) << 8 | u16::from(body_type)
    }
}
