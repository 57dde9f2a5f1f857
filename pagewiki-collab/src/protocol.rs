//! Wire envelopes exchanged over a collaboration socket.
//!
//! Every frame is a JSON text frame shaped `{"type": ..., "payload": ...}`.
//! Binary CRDT data (fragments, states) travels as base64 strings.

use pagewiki_types::UserId;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, ProtocolError};

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// One opaque edit fragment.
    Update(#[serde(with = "b64")] Vec<u8>),
    /// Ask for a fresh join-state (full resync).
    Sync,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Materialized page state covering every update up to `seq`.
    JoinState {
        #[serde(with = "b64")]
        state: Vec<u8>,
        seq: u64,
    },
    /// A peer's edit, relayed after it was durably appended.
    Update {
        seq: u64,
        author: UserId,
        #[serde(with = "b64")]
        fragment: Vec<u8>,
    },
    /// The submitter's own edit was persisted as `seq`.
    Ack { seq: u64 },
    Error { kind: String, message: String },
}

impl ServerFrame {
    pub fn error(err: &CollabError) -> Self {
        ServerFrame::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode(frame: &ServerFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_update_frame() {
        let frame = decode_client(r#"{"type":"update","payload":"aGVsbG8="}"#).unwrap();
        assert_eq!(frame, ClientFrame::Update(b"hello".to_vec()));
    }

    #[test]
    fn test_decode_sync_frame_without_payload() {
        assert_eq!(decode_client(r#"{"type":"sync"}"#).unwrap(), ClientFrame::Sync);
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = decode_client(r#"{"type":"delete_page","payload":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_bad_base64_is_protocol_error() {
        assert!(decode_client(r#"{"type":"update","payload":"not base64!"}"#).is_err());
        assert!(decode_client("not json").is_err());
    }

    #[test]
    fn test_server_update_frame_shape() {
        let frame = ServerFrame::Update {
            seq: 7,
            author: UserId::new("alice"),
            fragment: vec![0, 1, 2],
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["payload"]["seq"], 7);
        assert_eq!(value["payload"]["author"], "alice");
        assert_eq!(value["payload"]["fragment"], "AAEC");
    }

    #[test]
    fn test_error_frame_carries_kind() {
        let frame = ServerFrame::error(&CollabError::Forbidden);
        assert_eq!(
            frame,
            ServerFrame::Error {
                kind: "forbidden".into(),
                message: "edit capability required".into(),
            }
        );
    }
}
