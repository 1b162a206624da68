//! # Error Types
//!
//! Error handling for the LAN protocol stack.
//!
//! Every failure class the transport, codec, handshake, and session engine can
//! produce is a distinct variant, so callers can react to a signature mismatch
//! differently from a dead socket or an unanswered query.
//!
//! ## Error Categories
//! - **I/O errors**: socket and name-resolution failures
//! - **Protocol errors**: bad framing, integrity mismatches, handshake failures
//! - **Session errors**: timeouts, unsupported queries, commands while offline
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common cases.
pub mod constants {
    /// Framing errors
    pub const ERR_BAD_FRAME_MAGIC: &str = "outer frame does not start with 0x8370";
    pub const ERR_SHORT_FRAME: &str = "frame shorter than its declared size";
    pub const ERR_FRAME_NO_COUNTER: &str = "frame too short to carry a sequence counter";
    pub const ERR_BAD_PACKET_MAGIC: &str = "inner packet does not start with 0x5A5A";
    pub const ERR_SHORT_PACKET: &str = "inner packet shorter than header plus tag";
    pub const ERR_BAD_PACKET_LENGTH: &str = "inner packet length field is impossible";
    pub const ERR_SHORT_MESSAGE: &str = "appliance message shorter than 11 bytes";
    pub const ERR_BAD_MESSAGE_MAGIC: &str = "appliance message does not start with 0xAA";
    pub const ERR_OVERSIZED_MESSAGE: &str =
        "appliance message body does not fit the one-byte length header";
    pub const ERR_BLOCK_ALIGNMENT: &str = "buffer is not a multiple of the cipher block size";

    /// Integrity errors
    pub const ERR_FRAME_SIGNATURE: &str = "outer frame SHA-256 signature mismatch";
    pub const ERR_PACKET_TAG: &str = "inner packet MD5 tag mismatch";
    pub const ERR_MESSAGE_CHECKSUM: &str = "appliance message checksum mismatch";
    pub const ERR_PADDING: &str = "invalid PKCS#7 padding";

    /// Handshake errors
    pub const ERR_HANDSHAKE_SHORT: &str = "handshake response is not 64 bytes";
    pub const ERR_HANDSHAKE_SIGN: &str = "handshake response signature mismatch";
    pub const ERR_HANDSHAKE_NO_REPLY: &str = "no handshake response before the timeout";
    pub const ERR_MISSING_CREDENTIALS: &str = "protocol v3 requires a token and key";

    /// Session errors
    pub const ERR_SESSION_KEY_MISSING: &str = "no session key for an encrypted frame";
    pub const ERR_OBSERVER_LOCK: &str = "observer registry lock poisoned";
}

/// Primary error type for all protocol and session operations.
#[derive(Error, Debug)]
pub enum LanError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("integrity check failed: {0}")]
    Integrity(&'static str),

    #[error("framing error: {0}")]
    Framing(&'static str),

    #[error("no response within the wait window")]
    ResponseTimeout,

    #[error("every query in the refresh cycle is unsupported")]
    RefreshFailed,

    #[error("no inbound traffic for the heartbeat window")]
    HeartbeatTimeout,

    #[error("session is not connected")]
    NotConnected,

    #[error("device reported an error frame")]
    DeviceError,

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using [`LanError`].
pub type Result<T> = std::result::Result<T, LanError>;
