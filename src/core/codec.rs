//! Outer transport framing ("8370" frames).
//!
//! Protocol v3 wraps every inner envelope in a framed, signed, and (for
//! regular traffic) encrypted shell:
//!
//! ```text
//! offset 0  magic      0x83 0x70
//! offset 2  size       u16 BE; frame occupies size + 8 bytes on the wire
//! offset 4  marker     0x20
//! offset 5  nibbles    pad count << 4 | frame type
//! offset 6  counter    u16 BE sequence number, then the payload
//! tail      signature  32-byte SHA-256 over header ‖ plaintext (encrypted types)
//! ```
//!
//! Encrypted frame types carry `AES-256-CBC(counter ‖ payload ‖ random pad)`
//! under the session key followed by the signature; handshake types carry the
//! counter and payload in the clear. Decoding is stream-oriented: bytes are
//! fed into the state's receive buffer and complete frames are drained out,
//! with partial trailing data left for the next read.

use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use crate::core::crypto;
use crate::error::{constants, LanError, Result};

/// Outer frame magic.
pub const FRAME_MAGIC: [u8; 2] = [0x83, 0x70];

/// Frame type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    HandshakeRequest = 0x0,
    HandshakeResponse = 0x1,
    EncryptedResponse = 0x3,
    EncryptedRequest = 0x6,
}

impl FrameType {
    fn is_encrypted(self) -> bool {
        matches!(self, FrameType::EncryptedResponse | FrameType::EncryptedRequest)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Frame body with counter and padding stripped.
    Message(Vec<u8>),
    /// The device answered with a literal `ERROR` payload. Not an integrity
    /// failure; the session engine drops the socket and reconnects.
    Error,
}

/// Per-connection transport state: the session key once the handshake has
/// completed, both sequence counters, and the receive reassembly buffer.
///
/// The session key is present exactly while the connection is authenticated;
/// tearing down the socket clears it.
pub struct TransportState {
    tcp_key: Option<[u8; 32]>,
    request_counter: u16,
    response_counter: u16,
    recv_buffer: Vec<u8>,
}

impl TransportState {
    pub fn new() -> Self {
        Self {
            tcp_key: None,
            request_counter: 0,
            response_counter: 0,
            recv_buffer: Vec::new(),
        }
    }

    /// Install the session key after a successful handshake. Both counters
    /// restart from zero.
    pub fn set_tcp_key(&mut self, key: [u8; 32]) {
        self.tcp_key = Some(key);
        self.request_counter = 0;
        self.response_counter = 0;
        debug!("session key installed, counters reset");
    }

    /// Drop the session key and any buffered bytes; called on socket
    /// teardown.
    pub fn reset(&mut self) {
        if let Some(ref mut key) = self.tcp_key {
            key.zeroize();
        }
        self.tcp_key = None;
        self.request_counter = 0;
        self.response_counter = 0;
        self.recv_buffer.clear();
    }

    pub fn has_tcp_key(&self) -> bool {
        self.tcp_key.is_some()
    }

    pub fn request_counter(&self) -> u16 {
        self.request_counter
    }

    /// Sequence number observed on the most recent inbound frame. The
    /// protocol does not pair it with the request counter; NOTIFY frames
    /// arrive unsolicited.
    pub fn response_counter(&self) -> u16 {
        self.response_counter
    }

    /// Encode one outbound frame, consuming one request-counter value.
    ///
    /// # Errors
    /// `LanError::NotConnected` when an encrypted frame is requested before a
    /// session key exists.
    pub fn encode_frame(&mut self, payload: &[u8], frame_type: FrameType) -> Result<Vec<u8>> {
        if frame_type.is_encrypted() && self.tcp_key.is_none() {
            return Err(LanError::NotConnected);
        }

        let mut body = payload.to_vec();
        let mut pad = 0u8;
        let mut size = body.len();

        if frame_type.is_encrypted() {
            pad = ((16 - (body.len() + 2) % 16) % 16) as u8;
            size += pad as usize + 32;
            let mut padding = vec![0u8; pad as usize];
            rand::thread_rng().fill_bytes(&mut padding);
            body.extend_from_slice(&padding);
        }

        let mut header = [0u8; 6];
        header[0..2].copy_from_slice(&FRAME_MAGIC);
        header[2..4].copy_from_slice(&(size as u16).to_be_bytes());
        header[4] = 0x20;
        header[5] = pad << 4 | frame_type as u8;

        let mut data = Vec::with_capacity(2 + body.len());
        data.extend_from_slice(&self.request_counter.to_be_bytes());
        data.extend_from_slice(&body);
        self.request_counter = self.request_counter.wrapping_add(1);

        let mut out = Vec::with_capacity(6 + size);
        out.extend_from_slice(&header);
        if frame_type.is_encrypted() {
            let key = self
                .tcp_key
                .as_ref()
                .ok_or(LanError::NotConnected)?;
            let mut signed = header.to_vec();
            signed.extend_from_slice(&data);
            let sign = crypto::sha256(&signed);
            out.extend_from_slice(&crypto::encrypt_cbc(&data, key)?);
            out.extend_from_slice(&sign);
        } else {
            out.extend_from_slice(&data);
        }

        trace!(
            frame_type = ?frame_type,
            payload_len = payload.len(),
            counter = self.request_counter.wrapping_sub(1),
            "frame encoded"
        );
        Ok(out)
    }

    /// Append freshly received bytes to the reassembly buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.recv_buffer.extend_from_slice(bytes);
    }

    /// Drain every complete frame out of the reassembly buffer.
    ///
    /// Partial trailing bytes are kept for the next [`feed`](Self::feed);
    /// feeding one byte at a time yields exactly the frames that feeding the
    /// whole buffer at once would.
    ///
    /// # Errors
    /// `LanError::Framing` on a magic mismatch (the stream is unrecoverable)
    /// and `LanError::Integrity` on a signature mismatch that is not the
    /// device's `ERROR` reply. Either way the caller drops the socket.
    pub fn decode_stream(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            if self.recv_buffer.len() < 6 {
                return Ok(frames);
            }
            if self.recv_buffer[0..2] != FRAME_MAGIC {
                warn!("receive buffer desynchronized");
                return Err(LanError::Framing(constants::ERR_BAD_FRAME_MAGIC));
            }

            let size = u16::from_be_bytes([self.recv_buffer[2], self.recv_buffer[3]]) as usize;
            let total = size + 8;
            if self.recv_buffer.len() < total {
                return Ok(frames);
            }

            let packet: Vec<u8> = self.recv_buffer.drain(..total).collect();
            let frame_type = packet[5] & 0x0F;
            let pad = (packet[5] >> 4) as usize;

            let mut data = if frame_type == FrameType::EncryptedResponse as u8
                || frame_type == FrameType::EncryptedRequest as u8
            {
                if packet.len() < 6 + 16 + 32 {
                    return Err(LanError::Framing(constants::ERR_SHORT_FRAME));
                }
                let key = self
                    .tcp_key
                    .as_ref()
                    .ok_or(LanError::Framing(constants::ERR_SESSION_KEY_MISSING))?;
                let (ciphertext, sign) = packet[6..].split_at(packet.len() - 6 - 32);
                let plain = crypto::decrypt_cbc(ciphertext, key)?;

                let mut signed = packet[..6].to_vec();
                signed.extend_from_slice(&plain);
                if crypto::sha256(&signed) != sign {
                    if plain.starts_with(b"ERROR") {
                        debug!("device error frame");
                        frames.push(Frame::Error);
                        continue;
                    }
                    return Err(LanError::Integrity(constants::ERR_FRAME_SIGNATURE));
                }

                let mut plain = plain;
                if pad > 0 {
                    if pad >= plain.len() {
                        return Err(LanError::Framing(constants::ERR_SHORT_FRAME));
                    }
                    plain.truncate(plain.len() - pad);
                }
                plain
            } else {
                packet[6..].to_vec()
            };

            if data.len() < 2 {
                return Err(LanError::Framing(constants::ERR_FRAME_NO_COUNTER));
            }
            self.response_counter = u16::from_be_bytes([data[0], data[1]]);
            trace!(counter = self.response_counter, "frame decoded");
            frames.push(Frame::Message(data.split_off(2)));
        }
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportState {
    fn drop(&mut self) {
        if let Some(ref mut key) = self.tcp_key {
            key.zeroize();
        }
    }
}
