//! HELLO / ACK / HEARTBEAT message types and validators for the peer
//! session layer. Each message is a tagged variant so frames carry their
//! own discriminant end-to-end instead of a loose map type.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FEATURES, PROTO_VERSION};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub shares: Vec<String>,
    pub features: Vec<String>,
}

pub fn build_capabilities(shares: &[String]) -> Capabilities {
    let mut shares: Vec<String> = shares.to_vec();
    shares.sort();
    shares.dedup();
    Capabilities {
        shares,
        features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeMessage {
    #[serde(rename = "HELLO")]
    Hello {
        node_id: String,
        version: String,
        capabilities: Capabilities,
    },
    #[serde(rename = "ACK")]
    Ack {
        ok: bool,
        reason: Option<String>,
        peer_id: String,
        capabilities: Capabilities,
    },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { ts: i64 },
}

impl HandshakeMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Ack { .. } => "ACK",
            Self::Heartbeat { .. } => "HEARTBEAT",
        }
    }
}

pub fn build_hello(node_id: &str, shares: &[String]) -> HandshakeMessage {
    HandshakeMessage::Hello {
        node_id: node_id.to_string(),
        version: PROTO_VERSION.to_string(),
        capabilities: build_capabilities(shares),
    }
}

pub fn build_ack(
    ok: bool,
    reason: Option<String>,
    peer_id: &str,
    capabilities: Capabilities,
) -> HandshakeMessage {
    HandshakeMessage::Ack {
        ok,
        reason,
        peer_id: peer_id.to_string(),
        capabilities,
    }
}

pub fn build_heartbeat(ts: i64) -> HandshakeMessage {
    HandshakeMessage::Heartbeat { ts }
}

/// Major.minor compatibility: major versions must match exactly.
pub fn versions_compatible(a: &str, b: &str) -> bool {
    let major = |v: &str| v.split('.').next().unwrap_or(v).to_string();
    major(a) == major(b)
}

pub fn expect_hello(msg: HandshakeMessage) -> Result<(String, String, Capabilities), ProtocolError> {
    match msg {
        HandshakeMessage::Hello {
            node_id,
            version,
            capabilities,
        } => Ok((node_id, version, capabilities)),
        other => Err(ProtocolError::WrongMessageType {
            expected: "HELLO".to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

pub fn expect_ack(msg: HandshakeMessage) -> Result<(bool, Option<String>, String, Capabilities), ProtocolError> {
    match msg {
        HandshakeMessage::Ack {
            ok,
            reason,
            peer_id,
            capabilities,
        } => Ok((ok, reason, peer_id, capabilities)),
        other => Err(ProtocolError::WrongMessageType {
            expected: "ACK".to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

pub fn expect_heartbeat(msg: HandshakeMessage) -> Result<i64, ProtocolError> {
    match msg {
        HandshakeMessage::Heartbeat { ts } => Ok(ts),
        other => Err(ProtocolError::WrongMessageType {
            expected: "HEARTBEAT".to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_version_must_match() {
        assert!(versions_compatible("0.2", "0.9"));
        assert!(!versions_compatible("0.2", "1.0"));
    }

    #[test]
    fn capabilities_are_sorted_and_deduplicated() {
        let caps = build_capabilities(&["b".to_string(), "a".to_string(), "a".to_string()]);
        assert_eq!(caps.shares, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn round_trips_through_json_with_tag() {
        let hello = build_hello("node-a", &["docs".to_string()]);
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"type\":\"HELLO\""));
        let decoded: HandshakeMessage = serde_json::from_str(&json).unwrap();
        let (node_id, version, _) = expect_hello(decoded).unwrap();
        assert_eq!(node_id, "node-a");
        assert_eq!(version, PROTO_VERSION);
    }

    #[test]
    fn expect_hello_rejects_wrong_type() {
        let hb = build_heartbeat(0);
        assert!(expect_hello(hb).is_err());
    }
}
