//! WebSocket-Client für das Relay
//!
//! Persistenter, bidirektionaler, event-typisierter Kanal pro Mitglied:
//! - Hello-Handshake mit Identität + Familiengruppe beim Verbinden
//! - Event-basierte Zustellung eingehender Nachrichten
//! - begrenzte automatische Reconnects nach Verbindungsabriss

use super::messages::{ClientMessage, LocationSample, MemberStatus, ServerMessage};
use crate::config::ClientConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events, die der SignalingClient auslöst
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden und Handshake abgeschickt
    Connected,

    /// Verbindung getrennt (Reconnect läuft ggf. im Hintergrund)
    Disconnected,

    /// Eingehender Anruf
    IncomingCall { caller_id: String, signal: String },

    /// SDP Answer der Gegenseite
    CallAnswered { signal: String },

    /// ICE Candidate der Gegenseite
    CallCandidate { candidate: String },

    /// Die Gegenseite hat aufgelegt
    CallEnded,

    /// Zustellfehler vom Relay, z.B. reason = "offline"
    CallError { reason: String },

    /// Standort eines Familienmitglieds
    LocationUpdate {
        user_id: String,
        location: LocationSample,
    },

    /// Presence-Änderung in der Familie
    FamilyUpdate {
        user_id: String,
        status: MemberStatus,
    },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket-Client für die Relay-Kommunikation
pub struct SignalingClient {
    config: ClientConfig,
    user_id: String,
    family_id: String,
    state: RwLock<ClientState>,
    tx: RwLock<Option<mpsc::UnboundedSender<ClientMessage>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    closed: AtomicBool,
}

impl SignalingClient {
    pub fn new(config: ClientConfig, user_id: String, family_id: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            user_id,
            family_id,
            state: RwLock::new(ClientState::default()),
            tx: RwLock::new(None),
            event_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn family_id(&self) -> &str {
        &self.family_id
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Leitet die WebSocket-URL aus der konfigurierten Server-URL ab
    fn ws_url(&self) -> Result<String, SignalingError> {
        let mut url = Url::parse(&self.config.server_url)
            .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "wss" => return Ok(url.to_string()),
            "http" => "ws",
            "https" => "wss",
            other => return Err(SignalingError::InvalidUrl(format!("scheme {}", other))),
        };
        // set_scheme schlägt nur bei inkompatiblen Schemata fehl
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(self.config.server_url.clone()))?;
        Ok(url.to_string())
    }

    /// Verbindet mit dem Relay und schickt den Hello-Handshake.
    /// Spätere Abrisse werden im Hintergrund mit begrenzten Versuchen
    /// neu verbunden; der erste Aufbau muss gelingen.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SignalingError> {
        self.closed.store(false, Ordering::SeqCst);
        let url = self.ws_url()?;

        tracing::info!(member = %self.user_id, "connecting to relay: {}", url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        self.attach(ws_stream);
        Ok(())
    }

    /// Trennt die Verbindung und unterbindet weitere Reconnects
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.tx.write() = None;
        self.state.write().is_connected = false;
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    /// SDP Offer an ein Mitglied schicken
    pub fn send_offer(&self, callee_id: String, signal: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::CallOffer { callee_id, signal })
    }

    /// SDP Answer zurück an den Anrufer schicken
    pub fn send_answer(&self, caller_id: String, signal: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::CallAnswer { caller_id, signal })
    }

    /// ICE Candidate an die Gegenseite schicken
    pub fn send_candidate(&self, target_id: String, candidate: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::CallCandidate {
            target_id,
            candidate,
        })
    }

    /// Anruf beenden bzw. ablehnen
    pub fn send_end(&self, target_id: String) -> Result<(), SignalingError> {
        self.send(ClientMessage::CallEnd { target_id })
    }

    /// Eigenen Standort an die Familiengruppe melden
    pub fn send_location(&self, location: LocationSample) -> Result<(), SignalingError> {
        self.send(ClientMessage::LocationUpdate { location })
    }

    /// Non-blocking Push auf die Ausgangs-Queue des Write-Tasks
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.read();
        let tx = tx.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(msg)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Startet Read-/Write-Tasks auf einer frischen Verbindung
    fn attach(
        self: &Arc<Self>,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Hello muss der erste Frame sein
        let _ = tx.send(ClientMessage::Hello {
            user_id: self.user_id.clone(),
            family_id: self.family_id.clone(),
        });

        *self.tx.write() = Some(tx);
        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("failed to encode message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::debug!("websocket send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Read-Task
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => client.handle_server_message(msg),
                            Err(e) => {
                                tracing::warn!("dropping malformed server frame: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("websocket error: {}", e);
                        break;
                    }
                }
            }
            client.handle_disconnect();
        });
    }

    /// Mappt eingehende Relay-Nachrichten 1:1 auf Events
    fn handle_server_message(&self, msg: ServerMessage) {
        let event = match msg {
            ServerMessage::CallIncoming { caller_id, signal } => {
                SignalingEvent::IncomingCall { caller_id, signal }
            }
            ServerMessage::CallAnswered { signal } => SignalingEvent::CallAnswered { signal },
            ServerMessage::CallCandidate { candidate } => {
                SignalingEvent::CallCandidate { candidate }
            }
            ServerMessage::CallEnded => SignalingEvent::CallEnded,
            ServerMessage::CallError { reason } => SignalingEvent::CallError { reason },
            ServerMessage::LocationUpdate { user_id, location } => {
                SignalingEvent::LocationUpdate { user_id, location }
            }
            ServerMessage::FamilyUpdate { user_id, status } => {
                SignalingEvent::FamilyUpdate { user_id, status }
            }
        };
        let _ = self.event_tx.send(event);
    }

    /// Verbindungsende: Status zurücksetzen und ggf. Reconnect starten
    fn handle_disconnect(self: Arc<Self>) {
        *self.tx.write() = None;
        self.state.write().is_connected = false;
        let _ = self.event_tx.send(SignalingEvent::Disconnected);

        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        tokio::spawn(async move {
            for attempt in 1..=self.config.reconnect_attempts {
                tokio::time::sleep(self.config.reconnect_delay * attempt).await;
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }

                let url = match self.ws_url() {
                    Ok(url) => url,
                    Err(e) => {
                        tracing::error!("reconnect aborted: {}", e);
                        return;
                    }
                };

                tracing::info!(
                    member = %self.user_id,
                    "reconnecting to relay (attempt {}/{})",
                    attempt,
                    self.config.reconnect_attempts
                );
                match connect_async(url.as_str()).await {
                    Ok((ws_stream, _)) => {
                        self.attach(ws_stream);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("reconnect attempt {} failed: {}", attempt, e);
                    }
                }
            }
            tracing::error!(member = %self.user_id, "giving up on reconnecting to relay");
        });
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("user_id", &self.user_id)
            .field("family_id", &self.family_id)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}
