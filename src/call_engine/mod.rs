//! Call Engine Module - Aushandlung und Lebenszyklus von 1:1 Anrufen
//!
//! Dieses Modul verwaltet:
//! - Call Sessions (Zustandsautomat pro Anruf)
//! - Puffer für ICE Candidates und die Gesprächsdauer
//! - Schnittstellen zu Medienquellen und Peer Connections
//! - WebRTC Peer Connections (webrtc-rs)
//! - Mikrofon Capture (Feature `device-audio`)

mod actor;
#[cfg(feature = "device-audio")]
mod audio;
mod candidates;
mod engine;
mod media;
mod peer;
mod rtc;
mod session;
mod state;
mod timer;

#[cfg(feature = "device-audio")]
pub use audio::{DeviceAudioTrack, DeviceMediaSource, FRAME_SIZE, SAMPLE_RATE};
pub use candidates::CandidateBuffer;
pub use engine::CallEngine;
pub use media::{LocalMedia, LocalTrack, MediaError, MediaSource, TrackKind};
pub use peer::{
    ConnectionStateHandler, LocalCandidateHandler, PeerError, PeerTransport,
    PeerTransportFactory, RemoteTrackHandler, RemoteTrackInfo, TransportState,
};
pub use rtc::{RtcPeerFactory, RtcPeerTransport, AUDIO_CLOCK_RATE, VIDEO_CLOCK_RATE};
pub use session::{CallSession, CallTarget, Collaborators, SessionParams};
pub use state::{CallError, CallEvent, CallRole, CallSnapshot, CallState, CallSummary, EndReason};
pub use timer::{format_duration, CallTimer};
