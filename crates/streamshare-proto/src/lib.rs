//! Shared wire protocol for StreamShare signaling.
//!
//! Every event travels as one text frame holding a single JSON object with a
//! `type` discriminator. Clients address negotiation payloads with `to`; the
//! server rewrites them with `from` before relaying. Keeping this in its own
//! crate lets the server and the client agree on the exact field spelling
//! without either pulling in the other's runtime.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// A connectivity candidate in the shape browsers emit (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Messages sent from a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Register this channel under a participant identity.
    Subscribe {
        #[serde(rename = "userId")]
        user_id: String,
    },
    StartSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    JoinSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Offer {
        to: String,
        sdp: String,
    },
    Answer {
        to: String,
        sdp: String,
    },
    Ice {
        to: String,
        candidate: IceCandidate,
    },
    LeaveSession,
}

/// Messages sent from the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Subscribed {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Roster snapshot, sent to the joiner only.
    Peers { peers: Vec<String> },
    PeerJoined {
        #[serde(rename = "userId")]
        user_id: String,
    },
    PeerLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
    Offer {
        from: String,
        sdp: String,
    },
    Answer {
        from: String,
        sdp: String,
    },
    Ice {
        from: String,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::StartSession { .. } => "start-session",
            ClientMessage::JoinSession { .. } => "join-session",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Ice { .. } => "ice",
            ClientMessage::LeaveSession => "leave-session",
        }
    }

    /// Rewrites a point-to-point negotiation message into the form delivered
    /// to its target. Returns the target identity alongside the relayed
    /// message, or `None` for messages that are not relayed.
    pub fn relay_from(self, sender: &str) -> Option<(String, ServerMessage)> {
        let from = sender.to_string();
        match self {
            ClientMessage::Offer { to, sdp } => Some((to, ServerMessage::Offer { from, sdp })),
            ClientMessage::Answer { to, sdp } => Some((to, ServerMessage::Answer { from, sdp })),
            ClientMessage::Ice { to, candidate } => {
                Some((to, ServerMessage::Ice { from, candidate }))
            }
            _ => None,
        }
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Peers { .. } => "peers",
            ServerMessage::PeerJoined { .. } => "peer-joined",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::Ice { .. } => "ice",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a protocol message as a single text frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_client_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    decode_text(text)
}

pub fn decode_server_frame(text: &str) -> Result<ServerMessage, ProtocolError> {
    decode_text(text)
}

/// Binary frames are accepted when they carry UTF-8 JSON.
pub fn decode_client_bytes(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    decode_text(std::str::from_utf8(data)?)
}

pub fn decode_server_bytes(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    decode_text(std::str::from_utf8(data)?)
}

fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn parses_browser_ice_candidate() {
        let raw = r#"{
            "type": "ice",
            "to": "bob",
            "candidate": {
                "candidate": "candidate:842163049 1 udp 1677729535 203.0.113.7 3478 typ srflx",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": null
            }
        }"#;
        let message = decode_client_frame(raw).expect("decode ice");
        match message {
            ClientMessage::Ice { to, candidate } => {
                assert_eq!(to, "bob");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn session_messages_use_kebab_case_tags() {
        let start = decode_client_frame(r#"{"type":"start-session","sessionId":"room1"}"#)
            .expect("decode start");
        assert_eq!(
            start,
            ClientMessage::StartSession {
                session_id: "room1".into()
            }
        );
        let leave = decode_client_frame(r#"{"type":"leave-session"}"#).expect("decode leave");
        assert_eq!(leave, ClientMessage::LeaveSession);

        let encoded = encode_frame(&ServerMessage::PeerJoined {
            user_id: "Y".into(),
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value, json!({ "type": "peer-joined", "userId": "Y" }));
    }

    #[test]
    fn roster_snapshot_wire_shape() {
        let encoded = encode_frame(&ServerMessage::Peers {
            peers: vec!["X".into(), "Z".into()],
        })
        .expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value, json!({ "type": "peers", "peers": ["X", "Z"] }));
    }

    #[test]
    fn relay_rewrites_target_into_sender() {
        let offer = ClientMessage::Offer {
            to: "Y".into(),
            sdp: "v=0".into(),
        };
        let (target, relayed) = offer.relay_from("X").expect("offer is relayed");
        assert_eq!(target, "Y");
        assert_eq!(
            relayed,
            ServerMessage::Offer {
                from: "X".into(),
                sdp: "v=0".into()
            }
        );

        let value: Value =
            serde_json::from_str(&encode_frame(&relayed).expect("encode")).expect("json");
        assert_eq!(value["from"], "X");
        assert!(value.get("to").is_none());

        assert!(ClientMessage::LeaveSession.relay_from("X").is_none());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            decode_client_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"type":"offer","sdp":"v=0"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_client_bytes(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn binary_frames_carry_json() {
        let message =
            decode_server_bytes(br#"{"type":"subscribed","userId":"X"}"#).expect("decode");
        assert_eq!(
            message,
            ServerMessage::Subscribed {
                user_id: "X".into()
            }
        );
    }
}
