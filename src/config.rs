//! Laufzeit-Konfiguration für Relay und Client
//!
//! Defaults lassen sich über Umgebungsvariablen übersteuern
//! (`SKYE_BIND_ADDR`, `SKYE_SERVER_URL`).

use once_cell::sync::Lazy;
use std::time::Duration;
use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Fenster, in dem ein Offer beantwortet sein muss
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Abstand zwischen zwei Standortmeldungen während eines Anrufs
pub const LOCATION_INTERVAL: Duration = Duration::from_secs(10);

/// Reconnect-Versuche des Clients nach Verbindungsabriss
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Basis-Wartezeit zwischen Reconnect-Versuchen (wächst linear)
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Zeit, die das Relay auf den Hello-Frame wartet
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

static DEFAULT_ICE_SERVERS: Lazy<Vec<RTCIceServer>> = Lazy::new(|| {
    vec![
        // STUN für NAT-Traversal, reicht für die meisten Verbindungen
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
            ..Default::default()
        },
        // TURN als Relay-Fallback, wenn keine direkte Verbindung zustande kommt
        RTCIceServer {
            urls: vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443".to_string(),
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
            ],
            username: "openrelayproject".to_string(),
            credential: "openrelayproject".to_string(),
            credential_type: RTCIceCredentialType::Password,
            ..Default::default()
        },
    ]
});

/// Standard STUN/TURN Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    DEFAULT_ICE_SERVERS.clone()
}

// ============================================================================
// RELAY CONFIG
// ============================================================================

/// Konfiguration des Relay-Servers
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub handshake_timeout: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("SKYE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        Self {
            bind_addr,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Konfiguration der Client-Seite (Transport + Anruf-Engine)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// URL des Relay-Servers (`ws://` oder `wss://`, `http(s)` wird umgeschrieben)
    pub server_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub answer_timeout: Duration,
    pub location_interval: Duration,
    pub ice_servers: Vec<RTCIceServer>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let server_url =
            std::env::var("SKYE_SERVER_URL").unwrap_or_else(|_| "ws://localhost:3001".to_string());
        Self {
            server_url,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3001".to_string(),
            reconnect_attempts: RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            answer_timeout: ANSWER_TIMEOUT,
            location_interval: LOCATION_INTERVAL,
            ice_servers: default_ice_servers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_servers_have_stun_and_turn() {
        let servers = default_ice_servers();
        assert!(servers.iter().any(|s| s.urls.iter().any(|u| u.starts_with("stun:"))));
        assert!(servers.iter().any(|s| s.urls.iter().any(|u| u.starts_with("turn:"))));
    }
}
