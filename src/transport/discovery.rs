//! UDP device discovery.
//!
//! A fixed 64-byte probe goes out as a broadcast datagram; every appliance on
//! the segment answers with a `0x5A5A` identity blob (v3 devices wrap it in
//! the same `0x8370` shell the control channel uses). Responses are collected
//! until the timeout and deduplicated by device id.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{DiscoveryConfig, SessionConfig, CONTROL_PORT};
use crate::error::Result;

/// The discovery probe, sent verbatim.
pub const DISCOVERY_PROBE: [u8; 64] = [
    0x5a, 0x5a, 0x01, 0x11, 0x48, 0x00, 0x92, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7f, 0x75, 0xbd, 0x6b, 0x3e,
    0x4f, 0x8b, 0x76, 0x2e, 0x84, 0x9c, 0x6e, 0x57, 0x8d, 0x65, 0x90, 0x03, 0x6e, 0x9d, 0x43,
    0x42, 0xa5, 0x0f, 0x1f,
];

/// Smallest identity blob that carries all descriptor fields.
const MIN_RESPONSE_LEN: usize = 104;

/// Immutable identity of a discovered appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: u64,
    pub appliance_type: u8,
    pub serial: String,
    pub ssid: String,
    pub address: IpAddr,
    pub port: u16,
    pub protocol_version: u8,
}

impl DeviceDescriptor {
    /// Starting point for a session config; credentials still need filling
    /// in for v3 devices.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            name: self.ssid.clone(),
            device_id: self.id,
            ip: self.address.to_string(),
            port: self.port,
            protocol: self.protocol_version,
            ..SessionConfig::default()
        }
    }
}

/// Broadcast the probe and collect descriptors until the timeout elapses.
///
/// Responses are keyed by device id, so an appliance that answers on several
/// interfaces shows up once.
#[instrument(skip_all, fields(target = %config.broadcast_address, port = config.port))]
pub async fn discover(config: &DiscoveryConfig) -> Result<HashMap<u64, DeviceDescriptor>> {
    config.validate_strict()?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;

    let target = SocketAddr::new(
        config
            .broadcast_address
            .parse::<IpAddr>()
            .map_err(|e| crate::error::LanError::Config(e.to_string()))?,
        config.port,
    );
    socket.send_to(&DISCOVERY_PROBE, target).await?;
    debug!("probe sent");

    let mut devices = HashMap::new();
    let deadline = Instant::now() + config.timeout;
    let mut buf = [0u8; 512];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => {
                if let Some(descriptor) = parse_response(&buf[..len], addr.ip()) {
                    info!(
                        id = descriptor.id,
                        appliance_type = descriptor.appliance_type,
                        version = descriptor.protocol_version,
                        %addr,
                        "device discovered"
                    );
                    devices.insert(descriptor.id, descriptor);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "discovery receive failed");
            }
            Err(_) => break,
        }
    }

    debug!(count = devices.len(), "discovery window closed");
    Ok(devices)
}

/// Parse one discovery response into a descriptor.
///
/// v3 devices wrap the identity blob in the `0x8370` transport shell; the
/// shell is stripped before the `0x5A5A` blob is read. Anything malformed is
/// silently ignored, as the broadcast also reaches hosts that answer with
/// unrelated traffic.
pub fn parse_response(data: &[u8], address: IpAddr) -> Option<DeviceDescriptor> {
    let (blob, protocol_version) = if data.len() > 24 && data[0..2] == [0x83, 0x70] {
        (&data[8..data.len() - 16], 3)
    } else {
        (data, 2)
    };

    if blob.len() < MIN_RESPONSE_LEN || blob[0..2] != [0x5A, 0x5A] {
        return None;
    }

    let id = u64::from_le_bytes(blob[20..28].try_into().ok()?);
    Some(DeviceDescriptor {
        id,
        appliance_type: blob[38],
        serial: ascii_field(&blob[40..72]),
        ssid: ascii_field(&blob[72..104]),
        address,
        port: CONTROL_PORT,
        protocol_version,
    })
}

/// NUL-terminated ASCII field.
fn ascii_field(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).into_owned()
}

/// Byte-order variant of the cloud lookup identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpIdVariant {
    /// All eight id bytes, big-endian then reversed.
    Reversed,
    /// Low six id bytes, big-endian.
    SixByteBe,
    /// Low six id bytes, little-endian.
    SixByteLe,
}

/// Derive the 16-byte cloud lookup identifier for an appliance id, returned
/// as 32 lowercase hex characters.
pub fn udp_id(appliance_id: u64, variant: UdpIdVariant) -> String {
    let bytes: Vec<u8> = match variant {
        UdpIdVariant::Reversed => {
            let mut b = appliance_id.to_be_bytes().to_vec();
            b.reverse();
            b
        }
        UdpIdVariant::SixByteBe => appliance_id.to_be_bytes()[2..8].to_vec(),
        UdpIdVariant::SixByteLe => appliance_id.to_le_bytes()[0..6].to_vec(),
    };

    let digest = crate::core::crypto::sha256(&bytes);
    let mut id = [0u8; 16];
    for i in 0..16 {
        id[i] = digest[i] ^ digest[i + 16];
    }
    hex::encode(id)
}
