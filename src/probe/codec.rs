//! Loss-probe wire messages (JSON over the probe data channel).
//!
//! No version field. Unknown fields are ignored so newer clients can add
//! their own bookkeeping.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed probe: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Client → server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub seq: u64,
    /// Client clock, ms since epoch.
    pub sent_at: i64,
    #[serde(default)]
    pub size: u64,
}

/// Server → client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub ack: u64,
    /// Server clock, ms since epoch.
    pub received_at: i64,
    pub sent_at: i64,
}

impl Acknowledgment {
    pub fn for_probe(probe: &Probe, received_at: i64) -> Self {
        Self {
            ack: probe.seq,
            received_at,
            sent_at: probe.sent_at,
        }
    }
}

pub fn decode_probe(payload: &[u8]) -> Result<Probe, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_probe(probe: &Probe) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(probe)?))
}

pub fn decode_ack(payload: &[u8]) -> Result<Acknowledgment, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_ack(ack: &Acknowledgment) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(ack)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_probe_ignores_unknown_fields() {
        let probe = decode_probe(br#"{"seq":4,"sentAt":1700000000123,"size":64,"pad":"xxxx","v":2}"#)
            .unwrap();
        assert_eq!(
            probe,
            Probe {
                seq: 4,
                sent_at: 1_700_000_000_123,
                size: 64
            }
        );
    }

    #[test]
    fn test_decode_probe_size_optional() {
        let probe = decode_probe(br#"{"seq":0,"sentAt":1}"#).unwrap();
        assert_eq!(probe.size, 0);
    }

    #[test]
    fn test_decode_probe_rejects_malformed() {
        assert!(decode_probe(b"not json").is_err());
        assert!(decode_probe(br#"{"sentAt":1}"#).is_err());
        assert!(decode_probe(br#"{"seq":-1,"sentAt":1}"#).is_err());
        assert!(decode_probe(br#"{"seq":"1","sentAt":1}"#).is_err());
        assert!(decode_probe(b"").is_err());
    }

    #[test]
    fn test_ack_wire_field_names() {
        let probe = Probe {
            seq: 9,
            sent_at: 1000,
            size: 32,
        };
        let bytes = encode_ack(&Acknowledgment::for_probe(&probe, 1005)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["ack"], 9);
        assert_eq!(json["receivedAt"], 1005);
        assert_eq!(json["sentAt"], 1000);
        assert_eq!(decode_ack(&bytes).unwrap().ack, 9);
    }
}
