//! Call Lifecycle Controller
//!
//! Übersetzt Benutzeraktionen und Relay-Events in Engine-Operationen:
//! anrufen, annehmen, ablehnen, auflegen. Garantiert genau eine aktive
//! Session; ein eingehender Anruf während einer laufenden wird als
//! besetzt abgelehnt. Während der Verbindung meldet ein periodischer
//! Task den eigenen Standort. Die Oberfläche hängt nur an den
//! ControllerEvents, nie direkt an der Engine.

use super::engine::{CallEngine, CallError, CallEvent};
use super::session::{CallFailure, NegotiationState};
use crate::location::LocationProvider;
use crate::signaling::messages::{LocationSample, MemberStatus};
use crate::signaling::{SignalingClient, SignalingEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Fire-and-forget Hinweis auf einen eingehenden Anruf; läuft außerhalb
/// jeder Zustellgarantie des Signalings
pub trait IncomingCallAlert: Send + Sync {
    fn incoming_call(&self, caller_id: &str);
}

/// Default-Benachrichtigung: nur protokollieren
pub struct LogAlert;

impl IncomingCallAlert for LogAlert {
    fn incoming_call(&self, caller_id: &str) {
        tracing::info!(caller = %caller_id, "incoming call");
    }
}

// ============================================================================
// CONTROLLER EVENTS
// ============================================================================

/// Domänen-Events für die Oberfläche
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    IncomingCall { caller_id: String },
    CallStateChanged(NegotiationState),
    CallFailed(CallFailure),
    RemoteLocation {
        user_id: String,
        location: LocationSample,
    },
    PresenceChanged {
        user_id: String,
        status: MemberStatus,
    },
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

pub struct CallController {
    engine: Arc<CallEngine>,
    signaling: Arc<SignalingClient>,
    location: Arc<dyn LocationProvider>,
    alert: Arc<dyn IncomingCallAlert>,
    location_interval: Duration,
    event_tx: broadcast::Sender<ControllerEvent>,
    location_task: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        signaling: Arc<SignalingClient>,
        engine: Arc<CallEngine>,
        location: Arc<dyn LocationProvider>,
        alert: Arc<dyn IncomingCallAlert>,
        location_interval: Duration,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);

        Arc::new(Self {
            engine,
            signaling,
            location,
            alert,
            location_interval,
            event_tx,
            location_task: Mutex::new(None),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    /// Startet die beiden Event-Schleifen (Signaling und Engine)
    pub fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut signaling_rx = self.signaling.subscribe();
        tokio::spawn(async move {
            loop {
                match signaling_rx.recv().await {
                    Ok(event) => controller.handle_signaling_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("dropped {} signaling events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let controller = Arc::clone(self);
        let mut call_rx = self.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match call_rx.recv().await {
                    Ok(event) => controller.handle_call_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("dropped {} call events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Startet einen Anruf zur angegebenen Gegenseite
    pub async fn place_call(&self, remote_id: String) -> Result<(), CallError> {
        let offer = self.engine.place_call(remote_id.clone()).await?;
        if let Err(e) = self.signaling.send_offer(remote_id, offer) {
            tracing::error!("failed to send offer: {}", e);
            self.engine.fail(CallFailure::TransportDropped);
            return Err(CallError::TransportUnavailable);
        }
        Ok(())
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        let (remote, _) = self
            .engine
            .current_remote()
            .ok_or(CallError::NoActiveCall)?;
        let answer = self.engine.accept_call().await?;
        if let Err(e) = self.signaling.send_answer(remote, answer) {
            tracing::error!("failed to send answer: {}", e);
            self.engine.fail(CallFailure::TransportDropped);
            return Err(CallError::TransportUnavailable);
        }
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab
    pub fn decline_incoming(&self) {
        if let Some((remote, _)) = self.engine.current_remote() {
            self.engine.close();
            let _ = self.signaling.send_end(remote);
        }
    }

    /// Legt auf. Aus Sicht des Aufrufers sofort wirksam, der restliche
    /// Teardown läuft asynchron aus; mehrfaches Auflegen ist harmlos.
    pub fn hang_up(&self) {
        let remote = self.engine.current_remote();
        self.engine.close();
        if let Some((remote, _)) = remote {
            let _ = self.signaling.send_end(remote);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.engine.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    pub fn call_state(&self) -> Option<NegotiationState> {
        self.engine.state()
    }

    // ========================================================================
    // SIGNALING EVENTS
    // ========================================================================

    async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall { caller_id, signal } => {
                self.handle_incoming_call(caller_id, signal).await;
            }

            SignalingEvent::CallAnswered { signal } => {
                if let Err(e) = self.engine.handle_answer(signal).await {
                    tracing::error!("failed to handle answer: {}", e);
                }
            }

            SignalingEvent::CallCandidate { candidate } => {
                self.engine.add_remote_candidate(candidate).await;
            }

            SignalingEvent::CallEnded => {
                tracing::info!("call ended by peer");
                self.engine.close();
            }

            SignalingEvent::CallError { reason } => {
                tracing::warn!("relay rejected call: {}", reason);
                self.engine.fail(CallFailure::TargetUnreachable);
            }

            SignalingEvent::LocationUpdate { user_id, location } => {
                let _ = self
                    .event_tx
                    .send(ControllerEvent::RemoteLocation { user_id, location });
            }

            SignalingEvent::FamilyUpdate { user_id, status } => {
                let _ = self
                    .event_tx
                    .send(ControllerEvent::PresenceChanged { user_id, status });
            }

            SignalingEvent::Connected => {}

            SignalingEvent::Disconnected => {
                // eigener Transport weg: eine laufende Session sofort beenden,
                // die Gegenseite erledigt dasselbe über ihre eigene Beobachtung
                if self.engine.is_busy() {
                    self.engine.fail(CallFailure::TransportDropped);
                }
            }
        }
    }

    async fn handle_incoming_call(self: &Arc<Self>, caller_id: String, signal: String) {
        if self.engine.is_busy() {
            match self.engine.current_remote() {
                // Offer der laufenden Gegenseite ist ein ICE-Restart und
                // wird auf der bestehenden Session beantwortet
                Some((remote, _)) if remote == caller_id => {
                    match self.engine.handle_renegotiation_offer(signal).await {
                        Ok(answer) => {
                            if let Err(e) = self.signaling.send_answer(caller_id, answer) {
                                tracing::error!("failed to send renegotiation answer: {}", e);
                            }
                        }
                        Err(e) => tracing::error!("renegotiation failed: {}", e),
                    }
                }
                // besetzt: automatisch ablehnen
                _ => {
                    tracing::info!(caller = %caller_id, "busy, auto-declining incoming call");
                    let _ = self.signaling.send_end(caller_id);
                }
            }
            return;
        }

        self.alert.incoming_call(&caller_id);
        match self.engine.ring_incoming(caller_id.clone(), signal).await {
            Ok(()) => {
                let _ = self
                    .event_tx
                    .send(ControllerEvent::IncomingCall { caller_id });
            }
            Err(e) => {
                tracing::error!("failed to set up incoming call: {}", e);
                let _ = self.signaling.send_end(caller_id);
            }
        }
    }

    // ========================================================================
    // ENGINE EVENTS
    // ========================================================================

    fn handle_call_event(self: &Arc<Self>, event: CallEvent) {
        match event {
            CallEvent::StateChanged(state) => {
                // deckt neben den terminalen Zuständen auch den Rückfall auf
                // Connecting während eines Restarts ab
                match state {
                    NegotiationState::Connected => self.start_location_task(),
                    _ => self.stop_location_task(),
                }
                let _ = self.event_tx.send(ControllerEvent::CallStateChanged(state));
            }

            CallEvent::LocalCandidate { candidate } => {
                if let Some((remote, _)) = self.engine.current_remote() {
                    if let Err(e) = self.signaling.send_candidate(remote, candidate) {
                        tracing::warn!("failed to send ICE candidate: {}", e);
                    }
                }
            }

            CallEvent::RenegotiationOffer { sdp } => {
                if let Some((remote, _)) = self.engine.current_remote() {
                    if let Err(e) = self.signaling.send_offer(remote, sdp) {
                        tracing::error!("failed to resend offer after restart: {}", e);
                    }
                }
            }

            CallEvent::Failed(reason) => {
                let _ = self.event_tx.send(ControllerEvent::CallFailed(reason));
            }
        }
    }

    // ========================================================================
    // LOCATION TASK
    // ========================================================================

    /// Meldet den eigenen Standort im festen Takt, solange die Session
    /// verbunden ist; endet mit dem Anruf
    fn start_location_task(self: &Arc<Self>) {
        let mut guard = self.location_task.lock();
        if guard.is_some() {
            return;
        }

        let controller = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.location_interval);
            // der sofortige erste Tick entfällt, gemeldet wird erst nach
            // einem vollen Intervall
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if controller.engine.state() != Some(NegotiationState::Connected) {
                    break;
                }
                if let Some(sample) = controller.location.sample() {
                    if let Err(e) = controller.signaling.send_location(sample) {
                        tracing::warn!("failed to send location: {}", e);
                    }
                }
            }
        }));
    }

    fn stop_location_task(&self) {
        if let Some(task) = self.location_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("call_state", &self.call_state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::media::{opus_track, MediaError, MediaHandle, MediaProfile, MediaSource};
    use crate::config::ClientConfig;
    use crate::location::NoLocationProvider;

    struct StubSource;

    impl MediaSource for StubSource {
        fn acquire(&self, profile: MediaProfile) -> Result<MediaHandle, MediaError> {
            if profile.video {
                return Err(MediaError::NoDevice("no camera".to_string()));
            }
            Ok(MediaHandle::new(profile, vec![opus_track()], None))
        }
    }

    fn controller() -> Arc<CallController> {
        let config = ClientConfig::default();
        let signaling = Arc::new(SignalingClient::new(
            config.clone(),
            "a".to_string(),
            "fam1".to_string(),
        ));
        let engine = Arc::new(CallEngine::new(Arc::new(StubSource), &config));
        CallController::new(
            signaling,
            engine,
            Arc::new(NoLocationProvider),
            Arc::new(LogAlert),
            config.location_interval,
        )
    }

    #[tokio::test]
    async fn test_place_call_without_transport_fails_and_clears_session() {
        let controller = controller();

        let err = controller.place_call("b".to_string()).await.unwrap_err();
        assert!(matches!(err, CallError::TransportUnavailable));
        // keine hängende Session zurücklassen
        assert_eq!(controller.call_state(), None);
    }

    #[tokio::test]
    async fn test_hang_up_without_session_is_harmless() {
        let controller = controller();
        controller.hang_up();
        controller.hang_up();
        assert_eq!(controller.call_state(), None);
    }

    #[tokio::test]
    async fn test_decline_without_session_is_harmless() {
        let controller = controller();
        controller.decline_incoming();
        assert_eq!(controller.call_state(), None);
    }
}
