//! Medienbeschaffung für einen Anruf
//!
//! `MediaSource` ist die Kollaborateur-Grenze zum Gerätezugriff. Die
//! Engine fragt nie direkt nach Geräten, sondern läuft die Fallback-
//! Leiter ab: Video+Audio, dann nur Audio, dann ganz ohne lokale Spuren.

use super::audio::{AudioError, AudioHandler, SAMPLE_RATE};
use std::sync::Arc;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

// ============================================================================
// MEDIA PROFILE
// ============================================================================

/// Gewünschte lokale Spuren eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaProfile {
    pub video: bool,
    pub audio: bool,
}

impl MediaProfile {
    pub const FULL: Self = Self {
        video: true,
        audio: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        video: false,
        audio: true,
    };
    pub const NONE: Self = Self {
        video: false,
        audio: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("no capture device: {0}")]
    NoDevice(String),

    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio backend error: {0}")]
    Audio(#[from] AudioError),
}

// ============================================================================
// MEDIA HANDLE
// ============================================================================

/// Ergebnis einer Medienbeschaffung: lokale Spuren plus Gerätezugriff
pub struct MediaHandle {
    profile: MediaProfile,
    tracks: Vec<Arc<TrackLocalStaticRTP>>,
    audio: Option<AudioHandler>,
}

impl MediaHandle {
    pub fn new(
        profile: MediaProfile,
        tracks: Vec<Arc<TrackLocalStaticRTP>>,
        audio: Option<AudioHandler>,
    ) -> Self {
        Self {
            profile,
            tracks,
            audio,
        }
    }

    /// Signalisierungs-only: keine lokalen Spuren, kein Gerätezugriff
    pub fn empty() -> Self {
        Self::new(MediaProfile::NONE, Vec::new(), None)
    }

    pub fn profile(&self) -> MediaProfile {
        self.profile
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticRTP>] {
        &self.tracks
    }

    pub fn has_tracks(&self) -> bool {
        !self.tracks.is_empty()
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(audio) = &self.audio {
            audio.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.audio.as_ref().map(|a| a.is_muted()).unwrap_or(false)
    }

    /// Stoppt den Gerätezugriff und gibt die Spuren frei; idempotent
    pub fn stop(&mut self) {
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
        }
        self.tracks.clear();
    }
}

/// Opus-Spur mit den Parametern des Audio-Backends
pub fn opus_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        "audio".to_string(),
        "skye".to_string(),
    ))
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Kollaborateur-Grenze zum Gerätezugriff
pub trait MediaSource: Send + Sync {
    fn acquire(&self, profile: MediaProfile) -> Result<MediaHandle, MediaError>;
}

/// Gerätegestützte Quelle: Mikrofon über cpal. Video verlangt ein
/// Kamera-Backend, das diese Quelle nicht mitbringt, und degradiert
/// daher über die Fallback-Leiter.
pub struct DeviceMediaSource;

impl MediaSource for DeviceMediaSource {
    fn acquire(&self, profile: MediaProfile) -> Result<MediaHandle, MediaError> {
        if profile.video {
            return Err(MediaError::NoDevice("no camera backend".to_string()));
        }
        if !profile.audio {
            return Ok(MediaHandle::empty());
        }

        let mut audio = AudioHandler::new()?;
        audio.start_capture()?;
        audio.start_playback()?;

        // TODO: Opus-Encoder anbinden und Capture-Frames als RTP auf die
        // Spur schreiben; bis dahin bleibt die Spur ohne Payload
        Ok(MediaHandle::new(
            MediaProfile::AUDIO_ONLY,
            vec![opus_track()],
            Some(audio),
        ))
    }
}

/// Stufenweise Beschaffung: Video+Audio -> nur Audio -> ohne Medien.
/// Geräte- und Berechtigungsfehler degradieren gleichermaßen; dieser
/// Schritt allein bricht einen Anruf nie ab.
pub fn acquire_with_fallback(source: &dyn MediaSource, want: MediaProfile) -> MediaHandle {
    if want.video && want.audio {
        match source.acquire(MediaProfile::FULL) {
            Ok(handle) => return handle,
            Err(e) => {
                tracing::warn!("video+audio capture failed, falling back to audio only: {}", e);
            }
        }
    }
    if want.audio {
        match source.acquire(MediaProfile::AUDIO_ONLY) {
            Ok(handle) => return handle,
            Err(e) => {
                tracing::warn!("audio capture failed, continuing signaling-only: {}", e);
            }
        }
    }
    MediaHandle::empty()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Quelle, die gezielt pro Profil scheitert
    struct FakeSource {
        grant_video: bool,
        grant_audio: bool,
    }

    impl MediaSource for FakeSource {
        fn acquire(&self, profile: MediaProfile) -> Result<MediaHandle, MediaError> {
            if profile.video && !self.grant_video {
                return Err(MediaError::NoDevice("no camera".to_string()));
            }
            if profile.audio && !self.grant_audio {
                return Err(MediaError::PermissionDenied("microphone".to_string()));
            }
            Ok(MediaHandle::new(profile, vec![opus_track()], None))
        }
    }

    #[test]
    fn test_full_profile_granted_when_available() {
        let source = FakeSource {
            grant_video: true,
            grant_audio: true,
        };
        let handle = acquire_with_fallback(&source, MediaProfile::FULL);
        assert_eq!(handle.profile(), MediaProfile::FULL);
        assert!(handle.has_tracks());
    }

    #[test]
    fn test_video_failure_degrades_to_audio_only() {
        let source = FakeSource {
            grant_video: false,
            grant_audio: true,
        };
        let handle = acquire_with_fallback(&source, MediaProfile::FULL);
        assert_eq!(handle.profile(), MediaProfile::AUDIO_ONLY);
        assert!(handle.has_tracks());
    }

    #[test]
    fn test_all_failures_degrade_to_signaling_only() {
        let source = FakeSource {
            grant_video: false,
            grant_audio: false,
        };
        let handle = acquire_with_fallback(&source, MediaProfile::FULL);
        assert!(handle.profile().is_empty());
        assert!(!handle.has_tracks());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let source = FakeSource {
            grant_video: true,
            grant_audio: true,
        };
        let mut handle = acquire_with_fallback(&source, MediaProfile::FULL);
        handle.stop();
        handle.stop();
        assert!(!handle.has_tracks());
    }
}
