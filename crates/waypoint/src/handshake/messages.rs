//! Handshake wire messages.
//!
//! Messages are JSON objects tagged by `type`. Session tickets travel as
//! lowercase hex.

use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// Exact-match protocol version; no cross-version compatibility.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostWorldInfo {
    pub world_name: String,
    pub seed: i32,
    pub seed_name: String,
    pub world_uid: i64,
    pub world_gen_version: i32,
    pub net_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    /// Empty when the host asked for no password
    pub password_digest: String,
    #[serde(with = "hex_bytes")]
    pub session_ticket: Vec<u8>,
}

/// Side-specific half of [`PeerInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum PeerRole {
    Host(HostWorldInfo),
    Client(ClientCredentials),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub session_id: i64,
    pub version_string: String,
    pub protocol_version: u32,
    pub reference_position: Vec3,
    pub display_name: String,
    pub role: PeerRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Initiator's opening message; carries no payload.
    Request,
    Challenge { need_password: bool, salt: String },
    PeerInfo(PeerInfo),
    /// Synchronized state sent once a peer is admitted.
    Admitted {
        players: Vec<String>,
        admins: Vec<String>,
        world_time: f64,
    },
    /// Terminal failure, see [`crate::error::HandshakeError::code`].
    Error { code: u8 },
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = HandshakeMessage::Challenge {
            need_password: true,
            salt: "abc".to_string(),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes()).unwrap();
        assert_eq!(json["type"], "challenge");
        assert_eq!(json["need_password"], true);

        let info = HandshakeMessage::PeerInfo(PeerInfo {
            session_id: 7,
            version_string: "0.1.0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            reference_position: Vec3::new(1.0, 2.0, 3.0),
            display_name: "Ragnar".to_string(),
            role: PeerRole::Client(ClientCredentials {
                password_digest: String::new(),
                session_ticket: vec![0xde, 0xad],
            }),
        });
        let bytes = info.to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["role"]["session_ticket"], "dead");
        assert_eq!(HandshakeMessage::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(HandshakeMessage::from_bytes(b"{\"type\":\"shout\"}").is_err());
    }
}
