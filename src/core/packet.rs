//! Inner application envelope.
//!
//! Every command and status payload travels inside a `0x5A5A` envelope: a
//! 40-byte header carrying the device id and a reversed-pair local timestamp,
//! a body that is AES-128-ECB encrypted for regular traffic (heartbeats and
//! handshake-era packets go in the clear with adjusted version bytes), and a
//! trailing 16-byte salted MD5 tag over everything before it.
//!
//! Layout:
//!
//! ```text
//! offset 0   magic        0x5A 0x5A
//! offset 2   version      0x01 0x11 (encrypted body) or 0x01 0x10 (plain)
//! offset 4   length       u16 LE, header + body + tag
//! offset 6   flags        0x0020 (plain variant: byte 6 = 0x7B)
//! offset 8   message id   u32, always zero on this path
//! offset 12  timestamp    8 bytes, reversed pairs of YYYYMMDDHHmmssSS
//! offset 20  device id    u64 LE
//! offset 28  padding      12 zero bytes
//! offset 40  body
//! tail       MD5 tag      16 bytes
//! ```

use chrono::{Datelike, Local, Timelike};
use tracing::trace;

use crate::core::crypto;
use crate::error::{constants, LanError, Result};

/// Envelope magic.
pub const PACKET_MAGIC: [u8; 2] = [0x5A, 0x5A];

/// Header length in bytes.
pub const HEADER_LEN: usize = 40;

/// Smallest parseable envelope: header plus tag, empty body.
pub const MIN_PACKET_LEN: usize = HEADER_LEN + 16;

/// How the envelope body is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Body is AES-128-ECB encrypted under the fixed vendor key.
    Encrypted,
    /// Body is appended in the clear; version and flag bytes are adjusted.
    /// Used for heartbeats.
    Plain,
}

/// A parsed inner envelope with its body already decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPacket {
    pub device_id: u64,
    pub body: Vec<u8>,
}

/// Assemble an envelope around `command` for `device_id`.
pub fn build(device_id: u64, command: &[u8], kind: PacketKind) -> Vec<u8> {
    let body = match kind {
        PacketKind::Encrypted => crypto::encrypt_ecb(command),
        PacketKind::Plain => command.to_vec(),
    };

    let total = HEADER_LEN + body.len() + 16;
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&PACKET_MAGIC);
    match kind {
        PacketKind::Encrypted => packet.extend_from_slice(&[0x01, 0x11]),
        PacketKind::Plain => packet.extend_from_slice(&[0x01, 0x10]),
    }
    packet.extend_from_slice(&(total as u16).to_le_bytes());
    match kind {
        PacketKind::Encrypted => packet.extend_from_slice(&[0x20, 0x00]),
        PacketKind::Plain => packet.extend_from_slice(&[0x7B, 0x00]),
    }
    packet.extend_from_slice(&0u32.to_le_bytes());
    packet.extend_from_slice(&packet_time());
    packet.extend_from_slice(&device_id.to_le_bytes());
    packet.extend_from_slice(&[0u8; 12]);
    packet.extend_from_slice(&body);

    let tag = crypto::md5_tag(&packet);
    packet.extend_from_slice(&tag);
    packet
}

/// Parse and verify an envelope, decrypting the body when the version byte
/// says it is encrypted.
///
/// # Errors
/// `LanError::Framing` on bad magic or an impossible length field;
/// `LanError::Integrity` on a tag mismatch or garbled body padding.
pub fn parse(raw: &[u8]) -> Result<InnerPacket> {
    if raw.len() < MIN_PACKET_LEN {
        return Err(LanError::Framing(constants::ERR_SHORT_PACKET));
    }
    if raw[0..2] != PACKET_MAGIC {
        return Err(LanError::Framing(constants::ERR_BAD_PACKET_MAGIC));
    }

    let declared = u16::from_le_bytes([raw[4], raw[5]]) as usize;
    if declared < MIN_PACKET_LEN || declared > raw.len() {
        return Err(LanError::Framing(constants::ERR_BAD_PACKET_LENGTH));
    }

    let tag = crypto::md5_tag(&raw[..declared - 16]);
    if tag != raw[declared - 16..declared] {
        return Err(LanError::Integrity(constants::ERR_PACKET_TAG));
    }

    let body_slice = &raw[HEADER_LEN..declared - 16];
    let body = if raw[3] == 0x10 {
        body_slice.to_vec()
    } else {
        crypto::decrypt_ecb(body_slice)?
    };

    let device_id = u64::from_le_bytes(
        raw[20..28]
            .try_into()
            .map_err(|_| LanError::Framing(constants::ERR_SHORT_PACKET))?,
    );

    trace!(device_id, body_len = body.len(), "inner packet parsed");
    Ok(InnerPacket { device_id, body })
}

/// Split a protocol-v2 byte stream into complete envelopes.
///
/// v2 devices write envelopes back-to-back with no outer frame, so the length
/// field at offset 4 is the only delimiter. Complete envelopes are drained out
/// of `buffer`; a trailing partial envelope stays behind for the next read.
///
/// # Errors
/// `LanError::Framing` when the stream desynchronizes (wrong magic or an
/// impossible length); the caller should drop the socket.
pub fn split_v2_stream(buffer: &mut Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let mut packets = Vec::new();
    loop {
        if buffer.len() < 6 {
            return Ok(packets);
        }
        if buffer[0..2] != PACKET_MAGIC {
            return Err(LanError::Framing(constants::ERR_BAD_PACKET_MAGIC));
        }
        let declared = u16::from_le_bytes([buffer[4], buffer[5]]) as usize;
        if declared < MIN_PACKET_LEN {
            return Err(LanError::Framing(constants::ERR_BAD_PACKET_LENGTH));
        }
        if buffer.len() < declared {
            return Ok(packets);
        }
        packets.push(buffer.drain(..declared).collect());
    }
}

/// Current local time as the envelope's 8 timestamp bytes: the decimal pairs
/// of `YYYYMMDDHHmmssSS` in reverse order.
fn packet_time() -> [u8; 8] {
    let now = Local::now();
    let year = now.year();
    [
        (now.timestamp_subsec_millis() / 10) as u8,
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.day() as u8,
        now.month() as u8,
        (year % 100) as u8,
        (year / 100 % 100) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_roundtrip_encrypted() {
        let command = [0xAA, 0x20, 0xAC, 0x00, 0x03];
        let raw = build(0x0000_0000_075B_CD15, &command, PacketKind::Encrypted);

        assert_eq!(raw[0..2], PACKET_MAGIC);
        assert_eq!(raw[2..4], [0x01, 0x11]);
        assert_eq!(u16::from_le_bytes([raw[4], raw[5]]) as usize, raw.len());

        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.device_id, 123_456_789);
        assert_eq!(parsed.body, command);
    }

    #[test]
    fn build_parse_roundtrip_plain_heartbeat() {
        let raw = build(42, &[0x00], PacketKind::Plain);
        assert_eq!(raw[3], 0x10);
        assert_eq!(raw[6], 0x7B);
        assert_eq!(raw.len(), MIN_PACKET_LEN + 1);

        let parsed = parse(&raw).unwrap();
        assert_eq!(parsed.device_id, 42);
        assert_eq!(parsed.body, vec![0x00]);
    }

    #[test]
    fn tag_position_invariant() {
        let raw = build(7, &[0x01, 0x02, 0x03], PacketKind::Encrypted);
        let tag = crypto::md5_tag(&raw[..raw.len() - 16]);
        assert_eq!(tag, raw[raw.len() - 16..]);
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let mut raw = build(7, &[0x01], PacketKind::Encrypted);
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(parse(&raw), Err(LanError::Integrity(_))));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let mut raw = build(7, &[0x01, 0x02], PacketKind::Encrypted);
        raw[HEADER_LEN] ^= 0xFF;
        assert!(matches!(parse(&raw), Err(LanError::Integrity(_))));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(parse(&[0x5A; 10]), Err(LanError::Framing(_))));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut raw = build(7, &[0x01], PacketKind::Encrypted);
        raw[0] = 0x83;
        assert!(matches!(parse(&raw), Err(LanError::Framing(_))));
    }

    #[test]
    fn v2_stream_split_whole_and_partial() {
        let a = build(1, &[0x11], PacketKind::Encrypted);
        let b = build(2, &[0x22], PacketKind::Encrypted);

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&a);
        buffer.extend_from_slice(&b[..b.len() - 3]);

        let packets = split_v2_stream(&mut buffer).unwrap();
        assert_eq!(packets, vec![a]);
        assert_eq!(buffer.len(), b.len() - 3);

        buffer.extend_from_slice(&b[b.len() - 3..]);
        let packets = split_v2_stream(&mut buffer).unwrap();
        assert_eq!(packets, vec![b]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn v2_stream_desync_is_fatal() {
        let mut buffer = vec![0xFF; 64];
        assert!(split_v2_stream(&mut buffer).is_err());
    }
}
