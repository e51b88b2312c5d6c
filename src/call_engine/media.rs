//! Lokale Medienquellen (Mikrofon, Kamera)
//!
//! Die Session kennt nur diese Schnittstelle. Welche Geräte dahinterstehen,
//! entscheidet der Besitzer der Session.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Kamera fehlt oder wurde verweigert; Audio-only ist noch möglich
    #[error("Video unavailable: {0}")]
    VideoUnavailable(String),

    /// Mikrofon fehlt oder wurde verweigert
    #[error("Audio unavailable: {0}")]
    AudioUnavailable(String),

    #[error("Media device error: {0}")]
    Device(String),
}

impl MediaError {
    /// Nur fehlendes Video lässt sich durch Audio-only auffangen
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MediaError::VideoUnavailable(_))
    }
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Ein lokaler Capture-Track
///
/// `set_enabled(false)` entspricht Mute bzw. Kamera aus, `stop()` gibt das
/// Gerät frei und ist endgültig.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
}

/// Ergebnis einer Medien-Anforderung
#[derive(Clone)]
pub struct LocalMedia {
    pub audio: Arc<dyn LocalTrack>,
    pub video: Option<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    pub fn audio_only(audio: Arc<dyn LocalTrack>) -> Self {
        Self { audio, video: None }
    }

    /// Alle Tracks, Audio zuerst
    pub fn tracks(&self) -> Vec<Arc<dyn LocalTrack>> {
        let mut tracks = vec![Arc::clone(&self.audio)];
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video));
        }
        tracks
    }

    /// Stoppt alle Tracks
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("audio", &self.audio.id())
            .field("video", &self.video.as_ref().map(|v| v.id().to_string()))
            .finish()
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Liefert lokale Tracks
///
/// Kann beliebig lange dauern (Berechtigungsdialoge).
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Audio und optional Video anfordern.
    ///
    /// `VideoUnavailable` wenn Video gewünscht, aber nicht verfügbar ist;
    /// `AudioUnavailable` wenn kein Mikrofon verfügbar ist.
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError>;

    /// Nachträglich nur einen Video-Track anfordern
    async fn acquire_video(&self) -> Result<Arc<dyn LocalTrack>, MediaError>;
}
