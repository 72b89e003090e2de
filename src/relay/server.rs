//! WebSocket-Relay
//!
//! Nimmt Verbindungen an, führt den Hello-Handshake durch und vermittelt
//! danach Signal-Envelopes zwischen den Verbindungen der Presence Registry.
//! Das Relay kennt keinen Anruf-Zustand: nicht zustellbare Nachrichten
//! werden verworfen, nie gepuffert oder wiederholt. Zuverlässigkeit ist
//! Sache der Verhandlungslogik auf Client-Seite.

use crate::config::RelayConfig;
use crate::relay::presence::{ConnectionHandle, PresenceRegistry};
use crate::signaling::messages::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

// ============================================================================
// RELAY SERVER
// ============================================================================

/// Relay-Server: ein Task pro Verbindung, geteilte Registry
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<PresenceRegistry>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PresenceRegistry::new()),
        }
    }

    pub fn registry(&self) -> Arc<PresenceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bindet den konfigurierten Listener (Port 0 liefert einen freien Port)
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| RelayError::Bind {
                addr: self.config.bind_addr.clone(),
                source: e,
            })
    }

    /// Accept-Schleife; läuft bis der Prozess endet
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(%addr, "websocket handshake failed: {}", e);
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        // Hello-Frame abwarten; ohne gültige userId wird sofort getrennt
        let first = tokio::time::timeout(self.config.handshake_timeout, read.next()).await;
        let (user_id, family_id) = match first {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Hello { user_id, family_id }) if !user_id.is_empty() => {
                        (user_id, family_id)
                    }
                    _ => {
                        tracing::warn!(%addr, "connection without valid hello, disconnecting");
                        let _ = write.close().await;
                        return;
                    }
                }
            }
            _ => {
                tracing::warn!(%addr, "no hello within handshake window, disconnecting");
                let _ = write.close().await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let handle = ConnectionHandle::new(user_id.clone(), family_id.clone(), tx);
        tracing::info!(member = %user_id, family = %family_id, conn = %handle.conn_id, "member connected");
        self.registry.register(handle.clone());

        // Write-Task: entleert die Ausgangs-Queue in FIFO-Reihenfolge.
        // Die Queue pro Verbindung ist die einzige Ordnungsgarantie des Relays.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => route(&self.registry, &handle, msg),
                    Err(e) => {
                        tracing::warn!(member = %user_id, "dropping malformed frame: {}", e);
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(member = %user_id, "websocket error: {}", e);
                    break;
                }
            }
        }

        self.registry.unregister(&handle);
        writer.abort();
        tracing::info!(member = %user_id, conn = %handle.conn_id, "member disconnected");
    }
}

// ============================================================================
// ROUTING
// ============================================================================

/// Zustandslose Vermittlung: pro Envelope-Typ genau eine Zustellregel
fn route(registry: &PresenceRegistry, from: &ConnectionHandle, msg: ClientMessage) {
    match msg {
        // doppeltes Hello nach dem Handshake wird ignoriert
        ClientMessage::Hello { .. } => {}

        ClientMessage::CallOffer { callee_id, signal } => match registry.resolve(&callee_id) {
            Some(target) => {
                tracing::debug!(from = %from.member_id, to = %callee_id, "routing call offer");
                target.send(ServerMessage::CallIncoming {
                    caller_id: from.member_id.clone(),
                    signal,
                });
            }
            None => {
                tracing::debug!(from = %from.member_id, to = %callee_id, "callee not connected, failing fast");
                from.send(ServerMessage::CallError {
                    reason: "offline".to_string(),
                });
            }
        },

        // Answer/Candidate/End: zustellen oder stillschweigend verwerfen,
        // der Anrufer deckt das über seinen eigenen Timeout ab
        ClientMessage::CallAnswer { caller_id, signal } => {
            if let Some(target) = registry.resolve(&caller_id) {
                target.send(ServerMessage::CallAnswered { signal });
            }
        }

        ClientMessage::CallCandidate {
            target_id,
            candidate,
        } => {
            if let Some(target) = registry.resolve(&target_id) {
                target.send(ServerMessage::CallCandidate { candidate });
            }
        }

        ClientMessage::CallEnd { target_id } => {
            if let Some(target) = registry.resolve(&target_id) {
                target.send(ServerMessage::CallEnded);
            }
        }

        ClientMessage::LocationUpdate { location } => {
            registry.broadcast(
                &from.family_id,
                ServerMessage::LocationUpdate {
                    user_id: from.member_id.clone(),
                    location,
                },
                Some(from.conn_id),
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::LocationSample;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn connect(
        registry: &PresenceRegistry,
        member: &str,
        family: &str,
    ) -> (ConnectionHandle, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = unbounded_channel();
        let handle = ConnectionHandle::new(member.to_string(), family.to_string(), tx);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_offer_to_offline_member_fails_fast() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "fam1");
        drain(&mut rx_a);

        route(
            &registry,
            &a,
            ClientMessage::CallOffer {
                callee_id: "ghost".to_string(),
                signal: "sdp".to_string(),
            },
        );

        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            &msgs[0],
            ServerMessage::CallError { reason } if reason == "offline"
        ));
    }

    #[test]
    fn test_offer_to_online_member_delivers_incoming() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "fam1");
        let (_b, mut rx_b) = connect(&registry, "b", "fam1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        route(
            &registry,
            &a,
            ClientMessage::CallOffer {
                callee_id: "b".to_string(),
                signal: "sdp-offer".to_string(),
            },
        );

        let msgs = drain(&mut rx_b);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(
            &msgs[0],
            ServerMessage::CallIncoming { caller_id, signal }
                if caller_id == "a" && signal == "sdp-offer"
        ));
        // kein Fehler an den Anrufer
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_answer_to_offline_caller_is_dropped_silently() {
        let registry = PresenceRegistry::new();
        let (b, mut rx_b) = connect(&registry, "b", "fam1");
        drain(&mut rx_b);

        route(
            &registry,
            &b,
            ClientMessage::CallAnswer {
                caller_id: "gone".to_string(),
                signal: "sdp-answer".to_string(),
            },
        );

        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_candidate_and_end_are_forwarded() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "fam1");
        let (b, mut rx_b) = connect(&registry, "b", "fam1");
        drain(&mut rx_a);
        drain(&mut rx_b);

        route(
            &registry,
            &a,
            ClientMessage::CallCandidate {
                target_id: "b".to_string(),
                candidate: "cand-1".to_string(),
            },
        );
        route(
            &registry,
            &b,
            ClientMessage::CallEnd {
                target_id: "a".to_string(),
            },
        );

        let to_b = drain(&mut rx_b);
        assert!(matches!(
            &to_b[0],
            ServerMessage::CallCandidate { candidate } if candidate == "cand-1"
        ));
        let to_a = drain(&mut rx_a);
        assert!(matches!(&to_a[0], ServerMessage::CallEnded));
    }

    #[test]
    fn test_location_broadcast_excludes_sender_and_tags_user() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = connect(&registry, "a", "fam1");
        let (_b, mut rx_b) = connect(&registry, "b", "fam1");
        let (_c, mut rx_c) = connect(&registry, "c", "other");
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        route(
            &registry,
            &a,
            ClientMessage::LocationUpdate {
                location: LocationSample {
                    latitude: 52.0,
                    longitude: 4.0,
                    address: Some("Home".to_string()),
                    timestamp: 1,
                },
            },
        );

        assert!(drain(&mut rx_a).is_empty(), "sender must not receive its own location");
        let to_b = drain(&mut rx_b);
        assert!(matches!(
            &to_b[0],
            ServerMessage::LocationUpdate { user_id, location }
                if user_id == "a" && location.latitude == 52.0
        ));
        // andere Familie bleibt unberührt
        assert!(drain(&mut rx_c).is_empty());
    }
}
