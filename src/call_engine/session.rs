//! Call Session - Zustand eines einzelnen Anrufversuchs
//!
//! Hält alles, was ohne I/O entschieden werden kann: den
//! Verhandlungszustand, den Offer-Guard, das Restart-Budget und die
//! Warteschlange für zu früh eingetroffene Remote-Candidates. Die
//! Übergänge selbst stößt die Engine an.

use chrono::{DateTime, Utc};

// ============================================================================
// ROLES & FAILURE REASONS
// ============================================================================

/// Rolle innerhalb eines Anrufversuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Responder,
}

/// Grund, aus dem ein Anruf endgültig scheitert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Gegenseite nicht am Relay registriert
    TargetUnreachable,
    /// alle Medien-Fallbacks erschöpft
    MediaUnavailable,
    /// kein Answer innerhalb des Zeitfensters
    NegotiationTimeout,
    /// Verbindungsverlust, auch nach Restart
    ConnectivityLost,
    /// eigener Relay-Transport weggebrochen
    TransportDropped,
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallFailure::TargetUnreachable => "target unreachable",
            CallFailure::MediaUnavailable => "media unavailable",
            CallFailure::NegotiationTimeout => "negotiation timeout",
            CallFailure::ConnectivityLost => "connectivity lost",
            CallFailure::TransportDropped => "transport dropped",
        };
        f.write_str(s)
    }
}

// ============================================================================
// NEGOTIATION STATE
// ============================================================================

/// Verhandlungszustand einer Call Session
///
/// Initiator: Idle -> AcquiringMedia -> OfferSent -> Connecting -> Connected
/// Responder: Idle -> AcquiringMedia -> AwaitingAnswerSend -> Connecting -> Connected
/// Failed ist aus jedem nicht-terminalen Zustand erreichbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AcquiringMedia,
    OfferSent,
    AwaitingAnswerSend,
    Connecting,
    Connected,
    Failed(CallFailure),
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed(_))
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Client-lokaler Zustand eines Anrufversuchs, nie persistiert
#[derive(Debug)]
pub struct CallSession {
    remote_id: String,
    role: CallRole,
    state: NegotiationState,
    offer_sent: bool,
    restart_attempted: bool,
    pending_candidates: Vec<String>,
    ring_started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(remote_id: String, role: CallRole) -> Self {
        Self {
            remote_id,
            role,
            state: NegotiationState::Idle,
            offer_sent: false,
            restart_attempted: false,
            pending_candidates: Vec::new(),
            ring_started_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn ring_started_at(&self) -> DateTime<Utc> {
        self.ring_started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Start der Medienbeschaffung (Anruf platziert oder angenommen)
    pub fn begin_media(&mut self) {
        if self.state == NegotiationState::Idle {
            self.state = NegotiationState::AcquiringMedia;
        }
    }

    /// Verbraucht den Offer-Guard. Liefert false, wenn für diese Session
    /// bereits ein Offer unterwegs ist; nur ein Restart gibt den Guard
    /// wieder frei.
    pub fn consume_offer_slot(&mut self) -> bool {
        if self.offer_sent {
            return false;
        }
        self.offer_sent = true;
        true
    }

    /// Initiator: Offer ist raus, warten auf Answer
    pub fn mark_offer_sent(&mut self) {
        if !self.is_terminal() {
            self.state = NegotiationState::OfferSent;
        }
    }

    /// Responder: vorinitialisiert, wartet auf Annahme durch den Benutzer
    pub fn mark_awaiting_answer_send(&mut self) {
        if !self.is_terminal() {
            self.state = NegotiationState::AwaitingAnswerSend;
        }
    }

    pub fn mark_connecting(&mut self) {
        if !self.is_terminal() {
            self.state = NegotiationState::Connecting;
        }
    }

    /// Remote-Stream ist da; stellt außerdem das Restart-Budget neu
    pub fn mark_connected(&mut self) {
        if !self.is_terminal() {
            self.state = NegotiationState::Connected;
            self.connected_at = Some(Utc::now());
            self.restart_attempted = false;
        }
    }

    /// Genau ein automatischer Restart pro Ausfall: gibt den Offer-Guard
    /// frei und fällt auf Connecting zurück. Liefert false, wenn das
    /// Budget für diesen Ausfall schon verbraucht ist.
    pub fn begin_restart(&mut self) -> bool {
        if self.restart_attempted || self.is_terminal() {
            return false;
        }
        self.restart_attempted = true;
        self.offer_sent = false;
        self.state = NegotiationState::Connecting;
        true
    }

    /// true, solange ein Restart-Versuch läuft und die Verbindung noch
    /// nicht zurück ist
    pub fn restart_in_progress(&self) -> bool {
        self.restart_attempted && self.state == NegotiationState::Connecting
    }

    /// Terminal über Fehler; aus terminalen Zuständen ein No-op
    pub fn fail(&mut self, reason: CallFailure) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = NegotiationState::Failed(reason);
        true
    }

    /// Terminal über Auflegen; idempotent
    pub fn close(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = NegotiationState::Closed;
        true
    }

    // ========================================================================
    // CANDIDATE QUEUE
    // ========================================================================

    /// Merkt einen Remote-Candidate vor, bis die Remote-Description steht
    pub fn queue_candidate(&mut self, candidate: String) {
        self.pending_candidates.push(candidate);
    }

    /// Entnimmt die vorgemerkten Candidates in Ankunftsreihenfolge
    pub fn drain_candidates(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_candidates)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_slot_is_consumed_once() {
        let mut session = CallSession::new("b".to_string(), CallRole::Initiator);
        session.begin_media();

        assert!(session.consume_offer_slot());
        session.mark_offer_sent();
        assert!(!session.consume_offer_slot());
        assert_eq!(session.state(), NegotiationState::OfferSent);
    }

    #[test]
    fn test_restart_releases_offer_slot_once() {
        let mut session = CallSession::new("b".to_string(), CallRole::Initiator);
        session.begin_media();
        assert!(session.consume_offer_slot());
        session.mark_offer_sent();
        session.mark_connecting();
        session.mark_connected();

        // erster Ausfall: Restart erlaubt, Guard wieder frei
        assert!(session.begin_restart());
        assert_eq!(session.state(), NegotiationState::Connecting);
        assert!(session.restart_in_progress());
        assert!(session.consume_offer_slot());

        // zweiter Ausfall ohne zwischenzeitliches Connected: Budget verbraucht
        assert!(!session.begin_restart());

        // Connected stellt das Budget neu
        session.mark_connected();
        assert!(session.begin_restart());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut session = CallSession::new("b".to_string(), CallRole::Initiator);
        session.begin_media();

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), NegotiationState::Closed);
    }

    #[test]
    fn test_terminal_states_never_regress() {
        let mut session = CallSession::new("b".to_string(), CallRole::Responder);
        session.begin_media();
        assert!(session.fail(CallFailure::NegotiationTimeout));

        assert!(!session.close());
        assert!(!session.fail(CallFailure::ConnectivityLost));
        assert!(!session.begin_restart());
        session.mark_connected();
        assert_eq!(
            session.state(),
            NegotiationState::Failed(CallFailure::NegotiationTimeout)
        );
    }

    #[test]
    fn test_candidates_drain_in_arrival_order() {
        let mut session = CallSession::new("b".to_string(), CallRole::Responder);
        session.queue_candidate("one".to_string());
        session.queue_candidate("two".to_string());
        session.queue_candidate("three".to_string());

        assert_eq!(session.drain_candidates(), vec!["one", "two", "three"]);
        assert!(session.drain_candidates().is_empty());
    }

    #[test]
    fn test_responder_path_states() {
        let mut session = CallSession::new("a".to_string(), CallRole::Responder);
        assert_eq!(session.state(), NegotiationState::Idle);

        session.begin_media();
        assert_eq!(session.state(), NegotiationState::AcquiringMedia);

        session.mark_awaiting_answer_send();
        assert_eq!(session.state(), NegotiationState::AwaitingAnswerSend);

        session.mark_connecting();
        session.mark_connected();
        assert_eq!(session.state(), NegotiationState::Connected);
        assert!(session.connected_at().is_some());
    }
}
