//! Appliance adapter seam.
//!
//! The session engine knows nothing about what a dehumidifier's humidity byte
//! means. Each product category plugs in an adapter that supplies its extra
//! status queries and turns decrypted message bytes into a status map; the
//! engine holds exactly one adapter behind this trait and new categories plug
//! in without touching it.

use std::collections::HashMap;

use serde::Serialize;

use crate::protocol::message::ApplianceMessage;

/// Air conditioner category tag.
pub const TYPE_AIR_CONDITIONER: u8 = 0xAC;
/// Dehumidifier category tag.
pub const TYPE_DEHUMIDIFIER: u8 = 0xA1;
/// Fan category tag.
pub const TYPE_FAN: u8 = 0xFA;
/// Water heater category tag.
pub const TYPE_WATER_HEATER: u8 = 0xE2;

/// Status key every session publishes alongside adapter-specific keys.
pub const KEY_AVAILABLE: &str = "available";

/// Human-readable name for a known appliance category tag.
pub fn appliance_name(appliance_type: u8) -> Option<&'static str> {
    match appliance_type {
        TYPE_AIR_CONDITIONER => Some("air conditioner"),
        TYPE_DEHUMIDIFIER => Some("dehumidifier"),
        TYPE_FAN => Some("fan"),
        TYPE_WATER_HEATER => Some("water heater"),
        _ => None,
    }
}

/// One value in a status map.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Status published to observers: at least [`KEY_AVAILABLE`], plus whatever
/// the adapter extracted.
pub type StatusMap = HashMap<String, StatusValue>;

/// Capability set an appliance category exposes to the session engine.
pub trait ApplianceAdapter: Send + Sync {
    /// Category tag this adapter speaks for.
    fn appliance_type(&self) -> u8;

    /// Category-specific status queries sent on every refresh, after the
    /// generic capability query.
    fn build_queries(&self) -> Vec<ApplianceMessage>;

    /// Decode one decrypted appliance message into status values. An empty
    /// map means the message carried nothing observers care about.
    fn process_message(&self, message: &[u8]) -> StatusMap;
}

/// Adapter that adds no queries of its own and surfaces raw payload hex.
///
/// Useful for protocol exploration against categories without a decoder yet.
pub struct PassthroughAdapter {
    appliance_type: u8,
}

impl PassthroughAdapter {
    pub fn new(appliance_type: u8) -> Self {
        Self { appliance_type }
    }
}

impl ApplianceAdapter for PassthroughAdapter {
    fn appliance_type(&self) -> u8 {
        self.appliance_type
    }

    fn build_queries(&self) -> Vec<ApplianceMessage> {
        Vec::new()
    }

    fn process_message(&self, message: &[u8]) -> StatusMap {
        let mut status = StatusMap::new();
        status.insert(
            "payload".to_string(),
            StatusValue::Text(hex::encode(message)),
        );
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_appliance_names() {
        assert_eq!(appliance_name(0xAC), Some("air conditioner"));
        assert_eq!(appliance_name(0xA1), Some("dehumidifier"));
        assert_eq!(appliance_name(0xFA), Some("fan"));
        assert_eq!(appliance_name(0xE2), Some("water heater"));
        assert_eq!(appliance_name(0x00), None);
    }

    #[test]
    fn passthrough_surfaces_hex_payload() {
        let adapter = PassthroughAdapter::new(TYPE_FAN);
        assert_eq!(adapter.appliance_type(), 0xFA);
        assert!(adapter.build_queries().is_empty());

        let status = adapter.process_message(&[0xAA, 0x0B]);
        assert_eq!(
            status.get("payload"),
            Some(&StatusValue::Text("aa0b".to_string()))
        );
    }
}
