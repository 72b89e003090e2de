//! WebRTC Call Engine
//!
//! Die Verhandlungs-Zustandsmaschine pro Anrufversuch: besorgt lokale
//! Medien (mit Fallback-Leiter), erzeugt und konsumiert Offer/Answer,
//! tauscht ICE Candidates und überwacht die Verbindung. Genau eine
//! nicht-terminale Session pro Engine; Teardown ist idempotent und
//! verwirft noch laufende async-Ergebnisse über einen Epoch-Zähler.

use super::media::{acquire_with_fallback, MediaHandle, MediaProfile, MediaSource};
use super::session::{CallFailure, CallRole, CallSession, NegotiationState};
use crate::config::ClientConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Call torn down during setup")]
    Cancelled,

    #[error("Relay transport unavailable")]
    TransportUnavailable,
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Domänen-Events der Engine; der Lifecycle Controller abonniert sie.
/// Die Engine kennt weder UI noch Transport.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(NegotiationState),
    /// Lokal entdeckter ICE Candidate, sofort und einzeln zu versenden
    LocalCandidate { candidate: String },
    /// Restart-Offer nach Verbindungsverlust, erneut über das Relay zu senden
    RenegotiationOffer { sdp: String },
    Failed(CallFailure),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub struct CallEngine {
    session: Mutex<Option<CallSession>>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    media: Mutex<Option<MediaHandle>>,
    media_source: Arc<dyn MediaSource>,
    event_tx: broadcast::Sender<CallEvent>,
    ice_servers: Vec<RTCIceServer>,
    answer_timeout: Duration,
    /// true sobald die Remote-Description steht; vorher werden Candidates
    /// in der Session vorgemerkt
    remote_ready: AtomicBool,
    /// wächst bei jedem Teardown; verspätete async-Ergebnisse mit altem
    /// Epoch werden verworfen statt auf eine geschlossene Verbindung zu
    /// treffen
    epoch: AtomicU64,
}

impl CallEngine {
    pub fn new(media_source: Arc<dyn MediaSource>, config: &ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            session: Mutex::new(None),
            peer_connection: Mutex::new(None),
            media: Mutex::new(None),
            media_source,
            event_tx,
            ice_servers: config.ice_servers.clone(),
            answer_timeout: config.answer_timeout,
            remote_ready: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Aktueller Verhandlungszustand, None ohne Session
    pub fn state(&self) -> Option<NegotiationState> {
        self.session.lock().as_ref().map(|s| s.state())
    }

    /// Gegenseite und Rolle der aktuellen Session
    pub fn current_remote(&self) -> Option<(String, CallRole)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.remote_id().to_string(), s.role()))
    }

    /// Eine nicht-terminale Session blockiert jede neue
    pub fn is_busy(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| !s.is_terminal())
            .unwrap_or(false)
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(media) = self.media.lock().as_ref() {
            media.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.media
            .lock()
            .as_ref()
            .map(|m| m.is_muted())
            .unwrap_or(false)
    }

    // ========================================================================
    // OUTGOING CALL
    // ========================================================================

    /// Startet einen ausgehenden Anruf und liefert das Offer-SDP, das der
    /// Controller über das Relay versendet. Pro Session höchstens ein
    /// Offer; nur ein ICE-Restart gibt den Guard wieder frei.
    pub async fn place_call(self: &Arc<Self>, remote_id: String) -> Result<String, CallError> {
        {
            let mut session = self.session.lock();
            if session.as_ref().map(|s| !s.is_terminal()).unwrap_or(false) {
                return Err(CallError::AlreadyInCall);
            }
            let mut fresh = CallSession::new(remote_id, CallRole::Initiator);
            fresh.begin_media();
            *session = Some(fresh);
        }
        self.remote_ready.store(false, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.emit_state();

        let mut handle = acquire_with_fallback(self.media_source.as_ref(), MediaProfile::FULL);
        if self.torn_down(epoch) {
            handle.stop();
            return Err(CallError::Cancelled);
        }

        let pc = self.create_peer_connection().await?;
        for track in handle.tracks() {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::WebRtc(e.to_string()))?;
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        if self.torn_down(epoch) {
            handle.stop();
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
            return Err(CallError::Cancelled);
        }

        {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if !s.is_terminal() => {
                    if !s.consume_offer_slot() {
                        return Err(CallError::AlreadyInCall);
                    }
                    s.mark_offer_sent();
                }
                _ => return Err(CallError::Cancelled),
            }
        }

        *self.peer_connection.lock() = Some(Arc::clone(&pc));
        *self.media.lock() = Some(handle);
        if self.torn_down(epoch) {
            // Teardown kam noch während des Aufbaus: Reste abräumen
            self.close();
            return Err(CallError::Cancelled);
        }

        self.emit_state();
        self.spawn_answer_watchdog(epoch);

        Ok(offer.sdp)
    }

    /// Verarbeitet das Answer der Gegenseite (auch nach einem Restart)
    pub async fn handle_answer(&self, answer_sdp: String) -> Result<(), CallError> {
        let pc = self
            .peer_connection
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| CallError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        self.remote_ready.store(true, Ordering::SeqCst);
        self.drain_pending_candidates(&pc).await;

        {
            let mut session = self.session.lock();
            if let Some(s) = session.as_mut() {
                if s.state() == NegotiationState::OfferSent {
                    s.mark_connecting();
                }
            }
        }
        self.emit_state();
        Ok(())
    }

    // ========================================================================
    // INCOMING CALL
    // ========================================================================

    /// Eingehender Anruf: sofort vorinitialisieren (Medien, PeerConnection,
    /// Remote-Description), damit das Answer nach der Annahme ohne Wartezeit
    /// entsteht. Der Benutzer hat noch nicht angenommen.
    pub async fn ring_incoming(
        self: &Arc<Self>,
        caller_id: String,
        offer_sdp: String,
    ) -> Result<(), CallError> {
        {
            let mut session = self.session.lock();
            if session.as_ref().map(|s| !s.is_terminal()).unwrap_or(false) {
                return Err(CallError::AlreadyInCall);
            }
            let mut fresh = CallSession::new(caller_id, CallRole::Responder);
            fresh.begin_media();
            *session = Some(fresh);
        }
        self.remote_ready.store(false, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.emit_state();

        let mut handle = acquire_with_fallback(self.media_source.as_ref(), MediaProfile::FULL);
        if self.torn_down(epoch) {
            handle.stop();
            return Err(CallError::Cancelled);
        }

        let pc = self.create_peer_connection().await?;
        for track in handle.tracks() {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::WebRtc(e.to_string()))?;
        }

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| CallError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        if self.torn_down(epoch) {
            handle.stop();
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
            return Err(CallError::Cancelled);
        }

        *self.peer_connection.lock() = Some(Arc::clone(&pc));
        *self.media.lock() = Some(handle);
        if self.torn_down(epoch) {
            self.close();
            return Err(CallError::Cancelled);
        }
        self.remote_ready.store(true, Ordering::SeqCst);

        // vor der Description eingetroffene Candidates in Ankunftsreihenfolge
        self.drain_pending_candidates(&pc).await;

        {
            let mut session = self.session.lock();
            if let Some(s) = session.as_mut() {
                s.mark_awaiting_answer_send();
            }
        }
        self.emit_state();
        Ok(())
    }

    /// Annahme durch den Benutzer: Answer erzeugen und zurückgeben
    pub async fn accept_call(&self) -> Result<String, CallError> {
        {
            let session = self.session.lock();
            match session.as_ref() {
                Some(s) if s.state() == NegotiationState::AwaitingAnswerSend => {}
                _ => return Err(CallError::NoActiveCall),
            }
        }
        let pc = self
            .peer_connection
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        {
            let mut session = self.session.lock();
            if let Some(s) = session.as_mut() {
                s.mark_connecting();
            }
        }
        self.emit_state();
        Ok(answer.sdp)
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    /// Remote-Candidate anwenden; vor gesetzter Remote-Description wird er
    /// vorgemerkt und später in Ankunftsreihenfolge nachgezogen
    pub async fn add_remote_candidate(&self, candidate_json: String) {
        let pc = self.peer_connection.lock().clone();
        match pc {
            Some(pc) if self.remote_ready.load(Ordering::SeqCst) => {
                Self::apply_candidate(&pc, &candidate_json).await;
            }
            _ => {
                let mut session = self.session.lock();
                if let Some(s) = session.as_mut() {
                    if !s.is_terminal() {
                        s.queue_candidate(candidate_json);
                    }
                }
            }
        }
    }

    async fn apply_candidate(pc: &Arc<RTCPeerConnection>, candidate_json: &str) {
        match serde_json::from_str::<RTCIceCandidateInit>(candidate_json) {
            Ok(init) => {
                if let Err(e) = pc.add_ice_candidate(init).await {
                    tracing::warn!("failed to add ICE candidate: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("dropping malformed ICE candidate: {}", e);
            }
        }
    }

    async fn drain_pending_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let queued = {
            let mut session = self.session.lock();
            session
                .as_mut()
                .map(|s| s.drain_candidates())
                .unwrap_or_default()
        };
        for candidate in queued {
            Self::apply_candidate(pc, &candidate).await;
        }
    }

    // ========================================================================
    // RENEGOTIATION (ICE RESTART)
    // ========================================================================

    /// Responder-Seite eines ICE-Restarts: Offer auf der laufenden Session
    /// anwenden und das Answer zurückgeben
    pub async fn handle_renegotiation_offer(&self, offer_sdp: String) -> Result<String, CallError> {
        let pc = self
            .peer_connection
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| CallError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    /// ICE meldet Disconnected/Failed: genau ein automatischer Restart,
    /// danach ConnectivityLost
    async fn handle_connectivity_loss(self: &Arc<Self>) {
        let decision = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if !s.is_terminal() => Some((s.role(), s.begin_restart())),
                _ => None,
            }
        };
        let Some((role, can_restart)) = decision else {
            return;
        };

        if !can_restart {
            tracing::warn!("connectivity lost again, restart budget exhausted");
            self.fail(CallFailure::ConnectivityLost);
            return;
        }

        self.emit_state();
        let epoch = self.epoch.load(Ordering::SeqCst);

        match role {
            CallRole::Initiator => {
                tracing::warn!("connectivity lost, attempting ICE restart");
                if let Err(e) = self.send_restart_offer().await {
                    tracing::error!("ICE restart failed: {}", e);
                    self.fail(CallFailure::ConnectivityLost);
                    return;
                }
            }
            CallRole::Responder => {
                // die Gegenseite fährt den Restart; hier nur das Budget
                // verbrauchen und auf ihr Renegotiation-Offer warten
                tracing::warn!("connectivity lost, waiting for peer to restart");
            }
        }

        self.spawn_restart_watchdog(epoch);
    }

    async fn send_restart_offer(self: &Arc<Self>) -> Result<(), CallError> {
        let pc = self
            .peer_connection
            .lock()
            .clone()
            .ok_or(CallError::NoActiveCall)?;

        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = pc
            .create_offer(Some(options))
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        {
            let mut session = self.session.lock();
            let slot_consumed = match session.as_mut() {
                Some(s) => s.consume_offer_slot(),
                None => false,
            };
            if !slot_consumed {
                return Err(CallError::AlreadyInCall);
            }
        }

        let _ = self
            .event_tx
            .send(CallEvent::RenegotiationOffer { sdp: offer.sdp });
        Ok(())
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Beendet die Session. Aus Sicht des Aufrufers sofort wirksam; das
    /// Schließen der PeerConnection läuft asynchron aus. Idempotent, wirft
    /// nie.
    pub fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.remote_ready.store(false, Ordering::SeqCst);

        if let Some(mut handle) = self.media.lock().take() {
            handle.stop();
        }
        if let Some(pc) = self.peer_connection.lock().take() {
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }

        let closed = {
            let mut session = self.session.lock();
            match session.take() {
                Some(mut s) => s.close(),
                None => false,
            }
        };
        if closed {
            let _ = self
                .event_tx
                .send(CallEvent::StateChanged(NegotiationState::Closed));
        }
    }

    /// Terminal über Fehler: Grund melden, dann aufräumen wie bei close()
    pub fn fail(&self, reason: CallFailure) {
        let failed = {
            let mut session = self.session.lock();
            session.as_mut().map(|s| s.fail(reason)).unwrap_or(false)
        };
        if !failed {
            return;
        }

        tracing::warn!("call failed: {}", reason);
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(NegotiationState::Failed(reason)));
        let _ = self.event_tx.send(CallEvent::Failed(reason));
        self.close();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn torn_down(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn emit_state(&self) {
        if let Some(state) = self.state() {
            let _ = self.event_tx.send(CallEvent::StateChanged(state));
        }
    }

    /// Nach einem Restart bestätigt der ICE-Pfad die Erholung; ein neuer
    /// Remote-Track kommt dabei nicht, deshalb zählt hier der ICE-Zustand
    fn mark_reconnected(&self) {
        let changed = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.restart_in_progress() => {
                    s.mark_connected();
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::info!("connection recovered after ICE restart");
            let _ = self
                .event_tx
                .send(CallEvent::StateChanged(NegotiationState::Connected));
        }
    }

    fn mark_connected(&self) {
        let changed = {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if !s.is_terminal() && s.state() != NegotiationState::Connected => {
                    s.mark_connected();
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self
                .event_tx
                .send(CallEvent::StateChanged(NegotiationState::Connected));
        }
    }

    /// Unbeantwortetes Offer läuft nach dem Zeitfenster in NegotiationTimeout
    fn spawn_answer_watchdog(self: &Arc<Self>, epoch: u64) {
        let engine = Arc::clone(self);
        let window = self.answer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if engine.torn_down(epoch) {
                return;
            }
            if engine.state() == Some(NegotiationState::OfferSent) {
                tracing::warn!("no answer within {:?}", window);
                engine.fail(CallFailure::NegotiationTimeout);
            }
        });
    }

    /// Nach einem Restart muss die Verbindung im selben Fenster zurückkommen
    fn spawn_restart_watchdog(self: &Arc<Self>, epoch: u64) {
        let engine = Arc::clone(self);
        let window = self.answer_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if engine.torn_down(epoch) {
                return;
            }
            if engine.state() == Some(NegotiationState::Connecting) {
                tracing::warn!("ICE restart did not recover within {:?}", window);
                engine.fail(CallFailure::ConnectivityLost);
            }
        });
    }

    /// Baut die PeerConnection mit Default-Codecs und -Interceptors auf
    async fn create_peer_connection(
        self: &Arc<Self>,
    ) -> Result<Arc<RTCPeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| CallError::WebRtc(e.to_string()))?,
        );

        self.install_handlers(&pc);
        Ok(pc)
    }

    /// Registriert die Event-Handler der PeerConnection. Handler mit altem
    /// Epoch laufen nach einem Teardown ins Leere.
    fn install_handlers(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let epoch = self.epoch.load(Ordering::SeqCst);

        // lokale Candidates sofort und einzeln weiterreichen
        let engine = Arc::clone(self);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                let Some(c) = candidate else {
                    tracing::debug!("ICE gathering complete");
                    return;
                };
                if engine.torn_down(epoch) {
                    return;
                }
                match c.to_json() {
                    Ok(json) => match serde_json::to_string(&json) {
                        Ok(payload) => {
                            let _ = engine
                                .event_tx
                                .send(CallEvent::LocalCandidate { candidate: payload });
                        }
                        Err(e) => tracing::warn!("failed to encode ICE candidate: {}", e),
                    },
                    Err(e) => tracing::warn!("failed to export ICE candidate: {}", e),
                }
            })
        }));

        // erster Remote-Track schaltet auf Connected
        let engine = Arc::clone(self);
        pc.on_track(Box::new(move |track, _, _| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                if engine.torn_down(epoch) {
                    return;
                }
                tracing::info!("received remote track: {:?}", track.codec());
                engine.mark_connected();
            })
        }));

        // Liveness: ICE-Zustand treibt den Restart-Pfad
        let engine = Arc::clone(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                tracing::debug!("ICE connection state: {:?}", state);
                if engine.torn_down(epoch) {
                    return;
                }
                match state {
                    RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                        engine.handle_connectivity_loss().await;
                    }
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                        engine.mark_reconnected();
                    }
                    _ => {}
                }
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("peer connection state: {:?}", s);
            Box::pin(async {})
        }));
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::{opus_track, MediaError};

    /// Medienquelle ohne Geräte, nur Audio wird gewährt
    struct StubSource;

    impl MediaSource for StubSource {
        fn acquire(&self, profile: MediaProfile) -> Result<MediaHandle, MediaError> {
            if profile.video {
                return Err(MediaError::NoDevice("no camera".to_string()));
            }
            Ok(MediaHandle::new(profile, vec![opus_track()], None))
        }
    }

    fn engine() -> Arc<CallEngine> {
        Arc::new(CallEngine::new(
            Arc::new(StubSource),
            &ClientConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_place_call_produces_offer_and_blocks_second_session() {
        let engine = engine();

        let sdp = engine.place_call("b".to_string()).await.unwrap();
        assert!(sdp.contains("v=0"));
        assert_eq!(engine.state(), Some(NegotiationState::OfferSent));

        let err = engine.place_call("c".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::AlreadyInCall));

        engine.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_clears_session() {
        let engine = engine();
        engine.place_call("b".to_string()).await.unwrap();

        engine.close();
        assert_eq!(engine.state(), None);
        assert!(!engine.is_busy());

        // zweites Auflegen ist ein No-op
        engine.close();
        assert_eq!(engine.state(), None);
    }

    #[tokio::test]
    async fn test_candidates_are_queued_until_remote_description() {
        let engine = engine();
        engine.place_call("b".to_string()).await.unwrap();

        // Remote-Description steht noch nicht: darf nicht angewendet werden,
        // sondern wird vorgemerkt und wirft insbesondere nicht
        engine
            .add_remote_candidate(r#"{"candidate":"candidate:1 1 udp 1 127.0.0.1 9 typ host"}"#.to_string())
            .await;
        assert_eq!(engine.state(), Some(NegotiationState::OfferSent));

        engine.close();
    }

    #[tokio::test]
    async fn test_ring_incoming_preinitializes_responder() {
        let caller = engine();
        let offer_sdp = caller.place_call("b".to_string()).await.unwrap();

        let callee = engine();
        callee
            .ring_incoming("a".to_string(), offer_sdp)
            .await
            .unwrap();
        assert_eq!(
            callee.state(),
            Some(NegotiationState::AwaitingAnswerSend)
        );

        let answer_sdp = callee.accept_call().await.unwrap();
        assert!(answer_sdp.contains("v=0"));
        assert_eq!(callee.state(), Some(NegotiationState::Connecting));

        caller.handle_answer(answer_sdp).await.unwrap();
        assert_eq!(caller.state(), Some(NegotiationState::Connecting));

        caller.close();
        callee.close();
    }

    #[tokio::test]
    async fn test_fail_surfaces_reason_then_clears() {
        let engine = engine();
        engine.place_call("b".to_string()).await.unwrap();
        let mut events = engine.subscribe();

        engine.fail(CallFailure::TargetUnreachable);
        assert_eq!(engine.state(), None);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::Failed(CallFailure::TargetUnreachable)) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        // fail nach Teardown ist ein No-op
        engine.fail(CallFailure::ConnectivityLost);
    }
}
