//! Wire types shared by discovery, the WebSocket hub, and the REST plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed mDNS service type (spec §6.3).
pub const SERVICE_TYPE: &str = "_lumo-connect._tcp";
/// Fixed mDNS domain (spec §6.3).
pub const SERVICE_DOMAIN: &str = "local.";
/// Default freshness TTL for discovered peers (spec §6.3).
pub const DEFAULT_TTL_SECS: u64 = 60;

/// How often the background browse loop wakes (spec §4.2).
pub const BROWSE_INTERVAL_SECS: u64 = 30;
/// Deadline for a single `Browse` call (spec §4.2).
pub const BROWSE_DEADLINE_SECS: u64 = 5;

/// Heartbeat cadence for WebSocket clients, carried over from the teacher's
/// peer session heartbeat (`protocol.rs::HEARTBEAT_INTERVAL_SECS`).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 15;

/// Files above this size never travel over the WebSocket hub in-band; they
/// are routed through the chunked transfer manager instead (spec §4.4).
pub const WS_INLINE_SIZE_THRESHOLD: usize = 10 * 1024 * 1024;

/// Graceful-shutdown deadline for session teardown (spec §5).
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Magic bytes prepended to every UDP discovery datagram, carried over from
/// the teacher's `DISCOVERY_MAGIC` to avoid collisions with unrelated
/// broadcast traffic on the same LAN segment.
pub const DISCOVERY_MAGIC: &[u8; 8] = b"CONNECT1";

/// Broadcast beacon payload (spec §4.2's `Advertise`), sent periodically
/// over UDP by the discoverer's advertise loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryBeacon {
    pub instance_name: String,
    pub port: u16,
    pub info: HashMap<String, String>,
    pub seq: u64,
}

/// A discovered remote service (spec §3 `PeerEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub name: String,
    pub host: String,
    pub ip: String,
    pub port: u16,
    pub info: HashMap<String, String>,
    pub last_seen: u64,
}

/// The WebSocket transfer envelope (spec §4.4, §9: modeled as a sum type
/// rather than a record with optional fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileXfer {
    File {
        filename: String,
        size: u64,
        content: Vec<u8>,
    },
    Ack {
        filename: String,
    },
    Progress {
        filename: String,
        progress: u8,
    },
}

/// Encode a [`DiscoveryBeacon`] into a UDP datagram with the magic prefix.
pub fn encode_beacon(beacon: &DiscoveryBeacon) -> Vec<u8> {
    let json = serde_json::to_vec(beacon).expect("beacon serialization is infallible");
    let mut buf = Vec::with_capacity(DISCOVERY_MAGIC.len() + json.len());
    buf.extend_from_slice(DISCOVERY_MAGIC);
    buf.extend_from_slice(&json);
    buf
}

/// Decode a [`DiscoveryBeacon`] from a raw datagram. Returns `None` when the
/// magic prefix doesn't match or the JSON is malformed.
pub fn decode_beacon(data: &[u8]) -> Option<DiscoveryBeacon> {
    if data.len() <= DISCOVERY_MAGIC.len() || &data[..DISCOVERY_MAGIC.len()] != DISCOVERY_MAGIC {
        return None;
    }
    serde_json::from_slice(&data[DISCOVERY_MAGIC.len()..]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_round_trips() {
        let mut info = HashMap::new();
        info.insert("hostname".to_string(), "desk1".to_string());
        let beacon = DiscoveryBeacon {
            instance_name: "foo".to_string(),
            port: 8080,
            info,
            seq: 1,
        };
        let encoded = encode_beacon(&beacon);
        let decoded = decode_beacon(&encoded).expect("decode");
        assert_eq!(decoded.instance_name, "foo");
        assert_eq!(decoded.port, 8080);
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let mut data = b"WRONGMAG".to_vec();
        data.extend_from_slice(b"{}");
        assert!(decode_beacon(&data).is_none());
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(decode_beacon(b"short").is_none());
    }

    #[test]
    fn file_xfer_serializes_with_type_tag() {
        let msg = FileXfer::Ack {
            filename: "a.bin".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "ack");
        assert_eq!(v["filename"], "a.bin");
    }
}
