//! Zustände, Ergebnis und Fehler eines Anrufs

use super::media::MediaError;
use super::peer::{PeerError, RemoteTrackInfo};
use super::timer::{format_duration, CallTimer};
use crate::signaling::SignalingError;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("Signaling unreachable: {0}")]
    SignalingUnreachable(#[from] SignalingError),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(#[from] PeerError),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("Group calls are not supported yet")]
    GroupCallUnsupported,

    #[error("Call ended while the operation was pending")]
    Interrupted,

    #[error("Call session is closed")]
    SessionClosed,
}

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallRole::Caller => f.write_str("caller"),
            CallRole::Callee => f.write_str("callee"),
        }
    }
}

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Ausgehender Anruf wird aufgebaut
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Angenommen, Verbindung wird hergestellt
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Abgelehnt
    Declined,
    /// Anruf beendet
    Ended,
}

impl CallState {
    /// Erlaubte Übergänge; alles andere ist ein Programmfehler
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Calling, Connected)
                | (Calling, Ended)
                | (Ringing, Connecting)
                | (Ringing, Declined)
                | (Ringing, Ended)
                | (Connecting, Connected)
                | (Connecting, Ended)
                | (Connected, Ended)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Declined | CallState::Ended)
    }

    /// Noch nicht verbunden und noch nicht beendet
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Ringing | CallState::Connecting
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Declined => "declined",
            CallState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Warum ein Anruf endete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    LocalDecline,
    RemoteDecline,
    /// Peer Connection meldet failed/disconnected/closed
    PeerDisconnected,
    /// Niemand hat rechtzeitig angenommen
    RingTimeout,
    /// Besitzer hat die Session verworfen
    Disposed,
    /// Fataler Fehler, siehe `CallSummary::error`
    Failed,
}

// ============================================================================
// SUMMARY & SNAPSHOT
// ============================================================================

/// Ergebnis eines beendeten Anrufs, wird genau einmal an den Besitzer gemeldet
#[derive(Debug, Clone, PartialEq)]
pub struct CallSummary {
    pub session_id: String,
    pub role: CallRole,
    pub duration_seconds: u64,
    pub ever_connected: bool,
    pub wants_video: bool,
    pub final_state: CallState,
    pub reason: EndReason,
    pub error: Option<CallError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CallSummary {
    /// Text für den Chat-Verlauf
    pub fn status_text(&self) -> String {
        if self.ever_connected {
            return format!("Call ended · {}", format_duration(self.duration_seconds));
        }
        match self.reason {
            EndReason::LocalDecline | EndReason::RemoteDecline => "Call declined".to_string(),
            EndReason::RingTimeout => "No answer".to_string(),
            EndReason::Failed | EndReason::PeerDisconnected => "Call failed".to_string(),
            _ if self.final_state == CallState::Declined => "Call declined".to_string(),
            _ => "Call cancelled".to_string(),
        }
    }
}

/// Lesbarer Zustand für die UI
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub session_id: String,
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub role: CallRole,
    pub state: CallState,
    pub wants_video: bool,
    pub muted: bool,
    pub video_enabled: bool,
    pub ever_connected: bool,
    pub started_at: DateTime<Utc>,
    pub(crate) timer: CallTimer,
}

impl CallSnapshot {
    /// Laufende Gesprächsdauer; nach dem Ende eingefroren
    pub fn duration_seconds(&self) -> u64 {
        self.timer.elapsed()
    }
}

/// Events für die UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    /// Offer ist da, der Angerufene kann annehmen
    OfferReceived { video: bool },
    MuteChanged(bool),
    VideoChanged(bool),
    RemoteTrack(RemoteTrackInfo),
    Ended(CallSummary),
}

// ============================================================================
// TESTS
// ============================================================================
