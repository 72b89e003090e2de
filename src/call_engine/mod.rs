//! Call Engine Module - Verhandlung, Medien und Anruf-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - die Verhandlungs-Zustandsmaschine pro Anrufversuch (engine, session)
//! - den Anruf-Lebenszyklus samt Standortmeldungen (controller)
//! - Medienbeschaffung mit Fallback-Leiter (media)
//! - Audio Capture und Playback über cpal (audio)

mod audio;
mod controller;
mod engine;
mod media;
mod session;

pub use audio::{AudioError, AudioHandler, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use controller::{CallController, ControllerEvent, IncomingCallAlert, LogAlert};
pub use engine::{CallEngine, CallError, CallEvent};
pub use media::{DeviceMediaSource, MediaError, MediaHandle, MediaProfile, MediaSource};
pub use session::{CallFailure, CallRole, CallSession, NegotiationState};
