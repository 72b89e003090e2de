//! Message Types für das Signaling-Protokoll
//!
//! Beide Richtungen laufen als JSON über die WebSocket-Verbindung.
//! Der `type`-Tag trägt die Event-Namen (`call:offer`, `family:update`, ...),
//! die Feldnamen sind auf dem Draht camelCase.

use serde::{Deserialize, Serialize};

// ============================================================================
// SHARED TYPES
// ============================================================================

/// Erreichbarkeits-Status eines Familienmitglieds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Online,
    Offline,
    Busy,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Online => "ONLINE",
            MemberStatus::Offline => "OFFLINE",
            MemberStatus::Busy => "BUSY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONLINE" => Some(MemberStatus::Online),
            "OFFLINE" => Some(MemberStatus::Offline),
            "BUSY" => Some(MemberStatus::Busy),
            _ => None,
        }
    }
}

/// Rolle innerhalb der Familie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Parent,
    Child,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Parent => "PARENT",
            MemberRole::Child => "CHILD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PARENT" => Some(MemberRole::Parent),
            "CHILD" => Some(MemberRole::Child),
            _ => None,
        }
    }
}

/// Ephemere Standortmeldung, wird vom Kern nie persistiert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Unix-Millisekunden zum Aufnahmezeitpunkt
    pub timestamp: i64,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten, die ein Client an das Relay schickt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Handshake, muss der erste Frame nach dem Verbindungsaufbau sein.
    /// Ohne `userId` trennt das Relay sofort.
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "familyId")]
        family_id: String,
    },

    /// SDP Offer an ein Mitglied
    #[serde(rename = "call:offer")]
    CallOffer {
        #[serde(rename = "calleeId")]
        callee_id: String,
        signal: String,
    },

    /// SDP Answer zurück an den Anrufer
    #[serde(rename = "call:answer")]
    CallAnswer {
        #[serde(rename = "callerId")]
        caller_id: String,
        signal: String,
    },

    /// ICE Candidate an die Gegenseite
    #[serde(rename = "call:candidate")]
    CallCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        candidate: String,
    },

    /// Anruf beenden bzw. ablehnen
    #[serde(rename = "call:end")]
    CallEnd {
        #[serde(rename = "targetId")]
        target_id: String,
    },

    /// Eigener Standort, wird an die Familiengruppe verteilt
    #[serde(rename = "location:update")]
    LocationUpdate {
        #[serde(flatten)]
        location: LocationSample,
    },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle Nachrichten, die das Relay an einen Client zustellt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Eingehender Anruf
    #[serde(rename = "call:incoming")]
    CallIncoming {
        #[serde(rename = "callerId")]
        caller_id: String,
        signal: String,
    },

    /// Die Gegenseite hat angenommen
    #[serde(rename = "call:answered")]
    CallAnswered { signal: String },

    /// ICE Candidate der Gegenseite
    #[serde(rename = "call:candidate")]
    CallCandidate { candidate: String },

    /// Die Gegenseite hat aufgelegt (oder abgelehnt)
    #[serde(rename = "call:ended")]
    CallEnded,

    /// Zustellung fehlgeschlagen, z.B. `reason = "offline"`
    #[serde(rename = "call:error")]
    CallError { reason: String },

    /// Standort eines Familienmitglieds
    #[serde(rename = "location:update")]
    LocationUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        location: LocationSample,
    },

    /// Presence-Änderung in der Familiengruppe
    #[serde(rename = "family:update")]
    FamilyUpdate {
        #[serde(rename = "userId")]
        user_id: String,
        status: MemberStatus,
    },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let msg = ClientMessage::CallOffer {
            callee_id: "c1".to_string(),
            signal: "v=0...".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "call:offer");
        assert_eq!(json["calleeId"], "c1");
        assert_eq!(json["signal"], "v=0...");
    }

    #[test]
    fn test_hello_roundtrip() {
        let raw = r#"{"type":"hello","userId":"p1","familyId":"fam1"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Hello { user_id, family_id } => {
                assert_eq!(user_id, "p1");
                assert_eq!(family_id, "fam1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_location_update_flattens_sample() {
        let msg = ClientMessage::LocationUpdate {
            location: LocationSample {
                latitude: 52.3676,
                longitude: 4.9041,
                address: None,
                timestamp: 1700000000000,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "location:update");
        assert_eq!(json["latitude"], 52.3676);
        // address darf bei None nicht auf dem Draht erscheinen
        assert!(json.get("address").is_none());
    }

    #[test]
    fn test_family_update_status_names() {
        let msg = ServerMessage::FamilyUpdate {
            user_id: "c1".to_string(),
            status: MemberStatus::Online,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""status":"ONLINE""#));
        assert!(json.contains(r#""type":"family:update""#));
    }

    #[test]
    fn test_call_ended_has_no_payload() {
        let json = serde_json::to_string(&ServerMessage::CallEnded).unwrap();
        assert_eq!(json, r#"{"type":"call:ended"}"#);
    }
}
