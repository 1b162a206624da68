//! # midea-lan
//!
//! Local-area control for Midea-family appliances (air conditioners,
//! dehumidifiers, fans, water heaters) without cloud dependencies.
//! Devices are found with a UDP broadcast probe and controlled over a TCP
//! connection speaking the vendor's framed, signed, and encrypted binary
//! protocol.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use midea_lan::{discover, DeviceSession, DiscoveryConfig, PassthroughAdapter};
//!
//! # async fn run() -> midea_lan::Result<()> {
//! let devices = discover(&DiscoveryConfig::default()).await?;
//!
//! for descriptor in devices.values() {
//!     let mut config = descriptor.session_config();
//!     config.token = "…".into(); // 128 hex chars from pairing
//!     config.key = "…".into();   // 64 hex chars from pairing
//!
//!     let adapter = Arc::new(PassthroughAdapter::new(descriptor.appliance_type));
//!     let session = DeviceSession::new(config, adapter)?;
//!     session.register_observer(|status| println!("{status:?}"))?;
//!     session.open().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! - [`core`]: crypto primitives, the `0x5A5A` application envelope, and the
//!   `0x8370` transport codec with its per-session key and counters
//! - [`protocol`]: appliance messages, the session-key handshake, and the
//!   [`ApplianceAdapter`] seam product categories plug into
//! - [`service`]: the per-device background engine that connects,
//!   authenticates, refreshes, and reconnects
//! - [`transport`]: UDP discovery

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{Credentials, DiscoveryConfig, LanConfig, SessionConfig};
pub use error::{LanError, Result};
pub use protocol::appliance::{
    appliance_name, ApplianceAdapter, PassthroughAdapter, StatusMap, StatusValue,
};
pub use protocol::message::{ApplianceMessage, MessageType, MAX_BODY_LEN};
pub use service::dispatcher::ObserverId;
pub use service::session::DeviceSession;
pub use transport::discovery::{discover, udp_id, DeviceDescriptor, UdpIdVariant};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library version as reported by Cargo.
#[must_use]
pub fn version() -> &'static str {
    VERSION
}
