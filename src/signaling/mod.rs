//! Signaling Module - Wire-Protokoll und Client-Transport
//!
//! Dieses Modul enthält:
//! - die Signal-Envelopes beider Richtungen (messages)
//! - den WebSocket-Client mit Handshake und Auto-Reconnect (client)

mod client;
pub mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::{ClientMessage, LocationSample, MemberRole, MemberStatus, ServerMessage};
