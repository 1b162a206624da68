//! Protocol logic above the wire format: appliance messages, the session-key
//! handshake, and the adapter seam appliance categories plug into.

pub mod appliance;
pub mod handshake;
pub mod message;
