//! SKYE - Familien-Anrufe mit Live-Standort
//!
//! Eine Familiengruppe telefoniert untereinander per Audio/Video und
//! teilt während des Anrufs den Standort:
//! - Relay-Server mit Presence Registry und zustandsloser Vermittlung
//! - WebSocket-Transport pro Mitglied mit Auto-Reconnect
//! - WebRTC-Verhandlungsmaschine für 1:1-Anrufe
//! - Lifecycle Controller als Grenze zur Oberfläche
//! - SQLite für das lokale Familienverzeichnis

pub mod call_engine;
pub mod config;
pub mod database;
pub mod location;
pub mod relay;
pub mod signaling;
