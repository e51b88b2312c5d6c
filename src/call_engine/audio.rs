//! Mikrofon als Medienquelle
//!
//! Verwendet cpal für Cross-Platform Audio Capture. Der cpal-Stream ist nicht
//! `Send` und lebt deshalb auf einem eigenen Thread, der bis `stop()` läuft.
//! Eine Kamera gibt es hier nicht: Video-Anfragen scheitern mit dem
//! behebbaren `VideoUnavailable`.

use super::media::{LocalMedia, LocalTrack, MediaError, MediaSource, TrackKind};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Standard-Mikrofon des Systems
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceMediaSource;

impl DeviceMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError> {
        if wants_video {
            return Err(no_camera());
        }

        let track = tokio::task::spawn_blocking(DeviceAudioTrack::open)
            .await
            .map_err(|e| MediaError::Device(e.to_string()))??;

        Ok(LocalMedia::audio_only(Arc::new(track)))
    }

    async fn acquire_video(&self) -> Result<Arc<dyn LocalTrack>, MediaError> {
        Err(no_camera())
    }
}

fn no_camera() -> MediaError {
    MediaError::VideoUnavailable("no camera support on this device".to_string())
}

// ============================================================================
// AUDIO TRACK
// ============================================================================

/// Laufende Mikrofon-Aufnahme
///
/// Deaktiviert (Mute) landen keine Samples im Buffer, der Pegel wird aber
/// weiter gemessen.
pub struct DeviceAudioTrack {
    id: String,
    enabled: Arc<AtomicBool>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    input_level: Arc<Mutex<f32>>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl DeviceAudioTrack {
    /// Öffnet das Standard-Mikrofon und startet die Aufnahme
    pub fn open() -> Result<Self, MediaError> {
        let enabled = Arc::new(AtomicBool::new(true));
        let capture_buffer = Arc::new(Mutex::new(HeapRb::<f32>::new(RING_BUFFER_SIZE)));
        let input_level = Arc::new(Mutex::new(0.0));

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, MediaError>>();

        let capture = Capture {
            enabled: Arc::clone(&enabled),
            capture_buffer: Arc::clone(&capture_buffer),
            input_level: Arc::clone(&input_level),
        };

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match capture.start() {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Läuft bis stop() oder Drop
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::Device(e.to_string()))?;

        let rate = ready_rx
            .recv()
            .map_err(|e| MediaError::Device(e.to_string()))??;
        tracing::info!("Audio capture running at {} Hz", rate);

        Ok(Self {
            id: format!("audio-{}", Uuid::new_v4()),
            enabled,
            capture_buffer,
            input_level,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Liest einen Frame (20ms) aufgenommenes Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Eingangspegel (0.0 - 1.0) für Visualisierung
    pub fn level(&self) -> f32 {
        *self.input_level.lock()
    }
}

impl LocalTrack for DeviceAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("Audio muted: {}", !enabled);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for DeviceAudioTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DeviceAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("level", &self.level())
            .finish()
    }
}

// ============================================================================
// CAPTURE THREAD
// ============================================================================

struct Capture {
    enabled: Arc<AtomicBool>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    input_level: Arc<Mutex<f32>>,
}

impl Capture {
    fn start(self) -> Result<(Stream, u32), MediaError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| MediaError::AudioUnavailable("No audio input device found".into()))?;

        let config = find_best_input_config(&device)?;
        let source_sample_rate = config.sample_rate.0;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            source_sample_rate,
            config.channels
        );

        let Capture {
            enabled,
            capture_buffer,
            input_level,
        } = self;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    *input_level.lock() = rms(data);

                    if !enabled.load(Ordering::Relaxed) {
                        return;
                    }

                    let samples = resample(data, source_sample_rate, SAMPLE_RATE);
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::Device(e.to_string()))?;

        Ok((stream, source_sample_rate))
    }
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::AudioUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration: 48kHz F32, sonst F32 mit höchster Rate
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = || configs.iter().filter(|c| c.sample_format() == SampleFormat::F32);

    if let Some(config) = f32_configs()
        .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    f32_configs()
        .next()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| MediaError::AudioUnavailable("No F32 input configuration found".into()))
}

/// Pegel als RMS, auf 1.0 begrenzt
fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32)
        .sqrt()
        .min(1.0)
}

/// Einfaches lineares Resampling
fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to {
        return data.to_vec();
    }
    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
