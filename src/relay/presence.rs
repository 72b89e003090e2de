//! Presence Registry
//!
//! Bindet Mitglieds-IDs an ihre aktuell lebende Verbindung und hält die
//! Broadcast-Gruppen pro Familie. Rein im Speicher, keine Persistenz.
//! Invariante: pro Mitglied höchstens eine aktuelle Bindung; ein neuer
//! Connect derselben ID gewinnt (last-writer-wins), die alte Verbindung
//! wird von ihrem eigenen Disconnect-Pfad abgeräumt.

use crate::signaling::messages::{MemberStatus, ServerMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

/// Serverseitige Bindung eines Mitglieds an genau eine Verbindung
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub member_id: String,
    pub family_id: String,
    sender: UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(
        member_id: String,
        family_id: String,
        sender: UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            member_id,
            family_id,
            sender,
        }
    }

    /// Best-effort-Zustellung; eine tote Verbindung wird ignoriert
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.sender.send(msg);
    }
}

// ============================================================================
// PRESENCE REGISTRY
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    /// member_id -> aktuelle Bindung
    members: HashMap<String, ConnectionHandle>,
    /// family_id -> alle lebenden Verbindungen der Gruppe
    families: HashMap<String, Vec<ConnectionHandle>>,
}

/// Geteilter Zustand aller Verbindungs-Tasks, RwLock-geschützt.
/// Lookups sind read-mostly; Connects/Disconnects nehmen den Write-Lock kurz.
#[derive(Default)]
pub struct PresenceRegistry {
    inner: RwLock<RegistryInner>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindet das Mitglied an die Verbindung und tritt der Familiengruppe
    /// bei. Eine bestehende Bindung derselben ID wird abgelöst. Danach geht
    /// `family:update ONLINE` an die Gruppe (fire-and-forget).
    pub fn register(&self, handle: ConnectionHandle) {
        {
            let mut inner = self.inner.write();
            inner
                .families
                .entry(handle.family_id.clone())
                .or_default()
                .push(handle.clone());
            if let Some(old) = inner.members.insert(handle.member_id.clone(), handle.clone()) {
                tracing::debug!(
                    member = %handle.member_id,
                    old_conn = %old.conn_id,
                    new_conn = %handle.conn_id,
                    "superseding existing binding"
                );
            }
        }

        self.broadcast(
            &handle.family_id,
            ServerMessage::FamilyUpdate {
                user_id: handle.member_id.clone(),
                status: MemberStatus::Online,
            },
            None,
        );
    }

    /// Entfernt die Gruppenmitgliedschaft dieser Verbindung. Die
    /// Mitglieds-Bindung wird nur gelöst (und OFFLINE gemeldet), wenn die
    /// Verbindung noch die aktuelle ist; der verspätete Disconnect einer
    /// abgelösten Verbindung darf die neuere nicht überschreiben.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        let was_current = {
            let mut inner = self.inner.write();
            if let Some(group) = inner.families.get_mut(&handle.family_id) {
                group.retain(|h| h.conn_id != handle.conn_id);
                if group.is_empty() {
                    inner.families.remove(&handle.family_id);
                }
            }
            match inner.members.get(&handle.member_id) {
                Some(current) if current.conn_id == handle.conn_id => {
                    inner.members.remove(&handle.member_id);
                    true
                }
                _ => false,
            }
        };

        if was_current {
            self.broadcast(
                &handle.family_id,
                ServerMessage::FamilyUpdate {
                    user_id: handle.member_id.clone(),
                    status: MemberStatus::Offline,
                },
                None,
            );
        }
    }

    /// Liefert die aktuelle Bindung eines Mitglieds
    pub fn resolve(&self, member_id: &str) -> Option<ConnectionHandle> {
        self.inner.read().members.get(member_id).cloned()
    }

    /// Stellt ein Event an alle Verbindungen der Gruppe zu, optional ohne
    /// den Absender. Keine Zustellgarantie, keine Wiederholung.
    pub fn broadcast(&self, family_id: &str, msg: ServerMessage, exclude: Option<Uuid>) {
        let targets: Vec<ConnectionHandle> = {
            let inner = self.inner.read();
            match inner.families.get(family_id) {
                Some(group) => group
                    .iter()
                    .filter(|h| Some(h.conn_id) != exclude)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        for target in targets {
            target.send(msg.clone());
        }
    }

    /// Anzahl aktuell gebundener Mitglieder
    pub fn online_count(&self) -> usize {
        self.inner.read().members.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn handle(member: &str, family: &str) -> (ConnectionHandle, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = unbounded_channel();
        (
            ConnectionHandle::new(member.to_string(), family.to_string(), tx),
            rx,
        )
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_register_supersedes_previous_binding() {
        let registry = PresenceRegistry::new();
        let (first, _rx1) = handle("a", "fam1");
        let (second, _rx2) = handle("a", "fam1");

        registry.register(first);
        registry.register(second.clone());

        let resolved = registry.resolve("a").unwrap();
        assert_eq!(resolved.conn_id, second.conn_id);
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_stale_unregister_does_not_clobber_newer_connection() {
        let registry = PresenceRegistry::new();
        let (first, _rx1) = handle("a", "fam1");
        let (second, mut rx2) = handle("a", "fam1");

        registry.register(first.clone());
        registry.register(second.clone());
        drain(&mut rx2);

        // Disconnect der abgelösten Verbindung
        registry.unregister(&first);

        let resolved = registry.resolve("a").unwrap();
        assert_eq!(resolved.conn_id, second.conn_id);

        // und kein OFFLINE an die Gruppe
        let msgs = drain(&mut rx2);
        assert!(
            !msgs.iter().any(|m| matches!(
                m,
                ServerMessage::FamilyUpdate {
                    status: MemberStatus::Offline,
                    ..
                }
            )),
            "stale disconnect must not broadcast OFFLINE: {:?}",
            msgs
        );
    }

    #[test]
    fn test_unregister_current_binding_broadcasts_offline() {
        let registry = PresenceRegistry::new();
        let (a, _rx_a) = handle("a", "fam1");
        let (b, mut rx_b) = handle("b", "fam1");

        registry.register(a.clone());
        registry.register(b);
        drain(&mut rx_b);

        registry.unregister(&a);

        assert!(registry.resolve("a").is_none());
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::FamilyUpdate {
                user_id,
                status: MemberStatus::Offline,
            } if user_id == "a"
        )));
    }

    #[test]
    fn test_broadcast_can_exclude_sender() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = handle("a", "fam1");
        let (b, mut rx_b) = handle("b", "fam1");

        registry.register(a.clone());
        registry.register(b);
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.broadcast(
            "fam1",
            ServerMessage::CallEnded,
            Some(a.conn_id),
        );

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_broadcast_to_unknown_family_is_noop() {
        let registry = PresenceRegistry::new();
        registry.broadcast("nobody", ServerMessage::CallEnded, None);
    }
}
