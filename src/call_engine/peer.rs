//! Punkt-zu-Punkt Medienverbindung (Peer Transport)
//!
//! Abstraktion über eine Peer Connection: Offer/Answer, Candidates und
//! Zustandsmeldungen. `rtc.rs` implementiert sie mit webrtc-rs.

use super::media::{LocalTrack, TrackKind};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// STATE & CALLBACKS
// ============================================================================

/// Verbindungszustand, wie ihn die Peer Connection meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Zustände, in denen keine Medien mehr fließen
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Eingehender Track der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

pub type LocalCandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type RemoteTrackHandler = Box<dyn Fn(RemoteTrackInfo) + Send + Sync>;
pub type ConnectionStateHandler = Box<dyn Fn(TransportState) + Send + Sync>;

// ============================================================================
// PEER TRANSPORT
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError>;

    /// Ersetzt einen vorhandenen Track gleicher Art oder fügt ihn hinzu,
    /// ohne die Session neu auszuhandeln
    async fn replace_or_add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;

    fn on_local_candidate(&self, handler: LocalCandidateHandler);
    fn on_remote_track(&self, handler: RemoteTrackHandler);
    fn on_connection_state_change(&self, handler: ConnectionStateHandler);
}

/// Erzeugt pro Session eine neue Peer Connection
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_states() {
        assert!(TransportState::Failed.is_lost());
        assert!(TransportState::Disconnected.is_lost());
        assert!(TransportState::Closed.is_lost());
        assert!(!TransportState::Connected.is_lost());
        assert!(!TransportState::Connecting.is_lost());
    }
}
