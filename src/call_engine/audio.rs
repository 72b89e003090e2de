//! Audio Handler - Mikrofon-Capture und Wiedergabe
//!
//! cpal liefert die Gerätestreams, ein Ring-Buffer entkoppelt die
//! Realtime-Callbacks von der Engine. Mono, 48kHz, 20ms-Frames.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für Aufnahme und Wiedergabe
pub const SAMPLE_RATE: u32 = 48000;

/// Mono reicht für Sprache
pub const CHANNELS: u16 = 1;

/// Frame-Größe in Samples (20ms @ 48kHz)
pub const FRAME_SIZE: usize = 960;

/// Kapazität der Ring-Buffer zwischen Callback und Engine
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),
}

// ============================================================================
// AUDIO HANDLER
// ============================================================================

/// Gerätezugriff für einen laufenden Anruf
///
/// Die cpal-Streams sind nicht Send; sie leben und sterben mit diesem
/// Handler und werden bei stop() gedroppt.
pub struct AudioHandler {
    input_device: Option<Device>,
    output_device: Option<Device>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// aufgenommenes PCM, vom Capture-Callback gefüllt
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// abzuspielendes PCM, vom Playback-Callback geleert
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    is_muted: Arc<Mutex<bool>>,
}

// Die Streams selbst werden nie über Thread-Grenzen benutzt, nur der
// Handler als Ganzes wird zwischen Tasks gereicht.
unsafe impl Send for AudioHandler {}

impl AudioHandler {
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input_device = host.default_input_device();
        let output_device = host.default_output_device();

        if input_device.is_none() {
            tracing::warn!("no audio input device found");
        }
        if output_device.is_none() {
            tracing::warn!("no audio output device found");
        }

        Ok(Self {
            input_device,
            output_device,
            input_stream: None,
            output_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            is_muted: Arc::new(Mutex::new(false)),
        })
    }

    /// Startet die Mikrofon-Aufnahme
    pub fn start_capture(&mut self) -> Result<(), AudioError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(AudioError::NoInputDevice)?;
        let config = Self::pick_config(
            device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let source_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if *is_muted.lock() {
                        return;
                    }
                    let samples = resample(data, source_rate, SAMPLE_RATE);
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| tracing::error!("audio capture error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;
        self.input_stream = Some(stream);
        Ok(())
    }

    /// Startet die Wiedergabe
    pub fn start_playback(&mut self) -> Result<(), AudioError> {
        let device = self
            .output_device
            .as_ref()
            .ok_or(AudioError::NoOutputDevice)?;
        let config = Self::pick_config(
            device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let target_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let frames = data.len() / channels;
                    let ratio = SAMPLE_RATE as f32 / target_rate as f32;
                    let mut last = 0.0;

                    for i in 0..frames {
                        // pro Ausgabeframe je nach Ratio 0..n Quellsamples
                        // ziehen; bei 0 wird das letzte Sample gehalten
                        let take = (((i + 1) as f32 * ratio) as usize)
                            .saturating_sub((i as f32 * ratio) as usize);
                        for _ in 0..take.min(8) {
                            last = buffer.try_pop().unwrap_or(0.0);
                        }
                        for c in 0..channels {
                            data[i * channels + c] = last;
                        }
                    }
                },
                |err| tracing::error!("audio playback error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamStart(e.to_string()))?;
        self.output_stream = Some(stream);
        Ok(())
    }

    /// Stoppt beide Streams; mehrfaches Stoppen ist harmlos
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("audio streams stopped");
    }

    /// Liest einen vollen Frame aufgenommenes Audio, falls verfügbar
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Legt empfangene Samples in den Wiedergabe-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Bevorzugt F32 bei 48kHz, sonst die beste verfügbare Konfiguration
    fn pick_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
        let target = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.sample_format() == SampleFormat::F32
                && config.min_sample_rate() <= target
                && config.max_sample_rate() >= target
            {
                return Ok(config.with_sample_rate(target).into());
            }
        }
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                return Ok(config.with_max_sample_rate().into());
            }
        }
        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "no usable audio configuration".to_string(),
        ))
    }
}

/// Lineares Resampling auf die Ziel-Rate
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src = i as f32 / ratio;
            let idx = src as usize;
            let frac = src - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
