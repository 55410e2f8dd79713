//! Message Types für das Signaling-Protokoll
//!
//! JSON über WebSocket; jede Client-Nachricht trägt `type` und einen
//! Zeitstempel. Peer-IDs sind frei wählbar, `callId` ordnet SDP/ICE einem
//! Anruf zu.

use serde::{Deserialize, Serialize};

/// Server-Fehlercode: Peer-ID bereits vergeben
pub const ERROR_ID_TAKEN: i32 = 409;

/// Server-Fehlercode: Ziel-Peer nicht registriert
pub const ERROR_PEER_UNAVAILABLE: i32 = 404;

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Client-Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Peer-ID beanspruchen
    Register {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// SDP Offer senden
    Offer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
    },

    /// SDP Answer senden
    Answer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
    },

    /// ICE Candidate senden
    IceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        candidate: String,
    },

    /// Anruf beenden
    Hangup {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
    },

    /// Heartbeat
    Heartbeat {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

/// Client-Nachricht mit Zeitstempel
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    #[serde(flatten)]
    pub message: &'a ClientMessage,
    pub timestamp: i64,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Eingehendes SDP Offer
    IncomingOffer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Eingehendes SDP Answer
    IncomingAnswer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Eingehender ICE Candidate
    IncomingIceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        candidate: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Anruf wurde von der Gegenseite beendet
    CallEnded {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Ziel eines Offers ist nicht registriert
    PeerUnavailable {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        #[serde(default)]
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_format() {
        let msg = ClientMessage::Register {
            peer_id: "alice".to_string(),
        };
        let json = serde_json::to_value(Envelope {
            message: &msg,
            timestamp: 42,
        })
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({"type": "register", "peerId": "alice", "timestamp": 42})
        );
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let msg = ClientMessage::IceCandidate {
            from_peer_id: "a".to_string(),
            to_peer_id: "b".to_string(),
            call_id: "c1".to_string(),
            candidate: "{}".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ice_candidate");
        assert_eq!(json["toPeerId"], "b");
        assert_eq!(json["callId"], "c1");
    }

    #[test]
    fn test_parse_incoming_offer() {
        let raw = r#"{"type":"incoming_offer","fromPeerId":"bob","callId":"x","sdp":"v=0"}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ServerMessage::IncomingOffer {
                from_peer_id: "bob".to_string(),
                call_id: "x".to_string(),
                sdp: "v=0".to_string(),
                timestamp: 0,
            }
        );
    }

    #[test]
    fn test_parse_error() {
        let raw = r#"{"type":"error","code":409,"message":"taken","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ServerMessage::Error { code: ERROR_ID_TAKEN, .. }));
    }
}
