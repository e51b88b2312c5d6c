//! WebRTC Peer Connection (webrtc-rs)
//!
//! Implementiert `PeerTransport` mit einer `RTCPeerConnection`. Lokale Tracks
//! werden als `TrackLocalStaticRTP` ausgehandelt (Opus bzw. VP8); RTP-Pakete
//! schreibt der Besitzer über `rtp_track()`.

use super::media::{LocalTrack, TrackKind};
use super::peer::{
    ConnectionStateHandler, LocalCandidateHandler, PeerError, PeerTransport,
    PeerTransportFactory, RemoteTrackHandler, RemoteTrackInfo, TransportState,
};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Sample Rate für Opus
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video
pub const VIDEO_CLOCK_RATE: u32 = 90000;

const STREAM_ID: &str = "call-negotiator";

fn webrtc_error(e: webrtc::Error) -> PeerError {
    match e {
        webrtc::Error::ErrConnectionClosed => PeerError::Closed,
        other => PeerError::WebRTC(other.to_string()),
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `RtcPeerTransport`s
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = RtcPeerTransport::new(ice_servers).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

#[derive(Default)]
struct Handlers {
    local_candidate: RwLock<Option<LocalCandidateHandler>>,
    remote_track: RwLock<Option<RemoteTrackHandler>>,
    state: RwLock<Option<ConnectionStateHandler>>,
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    handlers: Arc<Handlers>,
    rtp_tracks: Mutex<Vec<Arc<TrackLocalStaticRTP>>>,
}

impl RtcPeerTransport {
    /// Erstellt eine neue Peer Connection
    pub async fn new(ice_servers: &[IceServerConfig]) -> Result<Self, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_error)?);

        let transport = Self {
            pc,
            handlers: Arc::new(Handlers::default()),
            rtp_tracks: Mutex::new(Vec::new()),
        };
        transport.setup_peer_connection_handlers();

        Ok(transport)
    }

    /// RTP-Track einer Art, sobald er hinzugefügt wurde
    pub fn rtp_track(&self, kind: TrackKind) -> Option<Arc<TrackLocalStaticRTP>> {
        self.rtp_tracks
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind() == codec_type(kind))
            .cloned()
    }

    /// Leitet die Callbacks der Peer Connection an die registrierten Handler weiter
    fn setup_peer_connection_handlers(&self) {
        // Connection State Handler
        let handlers = Arc::clone(&self.handlers);
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::debug!("Peer connection state: {:?}", s);
                if let Some(state) = transport_state(s) {
                    if let Some(handler) = handlers.state.read().as_ref() {
                        handler(state);
                    }
                }
                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let handlers = Arc::clone(&self.handlers);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            if let Some(handler) = handlers.local_candidate.read().as_ref() {
                                handler(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                    username_fragment: init.username_fragment,
                                });
                            }
                        }
                        Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        // Track Handler
        let handlers = Arc::clone(&self.handlers);
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            tracing::info!("Received track: {:?}", track.codec());

            if let Some(kind) = kind {
                if let Some(handler) = handlers.remote_track.read().as_ref() {
                    handler(RemoteTrackInfo {
                        id: track.id(),
                        kind,
                    });
                }
            }
            Box::pin(async {})
        }));
    }

    fn rtp_track_for(&self, track: &dyn LocalTrack) -> Arc<TrackLocalStaticRTP> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        let rtp = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));
        self.rtp_tracks.lock().push(Arc::clone(&rtp));
        rtp
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_error)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(webrtc_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(webrtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(webrtc_error)
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let rtp = self.rtp_track_for(track.as_ref());
        self.pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_error)?;
        Ok(())
    }

    async fn replace_or_add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let wanted = codec_type(track.kind());

        for sender in self.pc.get_senders().await {
            let Some(existing) = sender.track().await else {
                continue;
            };
            if existing.kind() == wanted {
                let rtp = self.rtp_track_for(track.as_ref());
                tracing::debug!("Replacing local {} track", track.kind());
                return sender
                    .replace_track(Some(rtp as Arc<dyn TrackLocal + Send + Sync>))
                    .await
                    .map_err(webrtc_error);
            }
        }

        self.add_track(track).await
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(webrtc_error)
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.handlers.local_candidate.write() = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.handlers.remote_track.write() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        *self.handlers.state.write() = Some(handler);
    }
}

impl std::fmt::Debug for RtcPeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeerTransport")
            .field("state", &self.pc.connection_state())
            .field("local_tracks", &self.rtp_tracks.lock().len())
            .finish()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(PeerError::InvalidSdp(format!(
            "unexpected description type {:?}",
            other
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubTrack {
        id: String,
        kind: TrackKind,
        enabled: AtomicBool,
    }

    impl StubTrack {
        fn new(id: &str, kind: TrackKind) -> Arc<dyn LocalTrack> {
            Arc::new(Self {
                id: id.to_string(),
                kind,
                enabled: AtomicBool::new(true),
            })
        }
    }

    impl LocalTrack for StubTrack {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
        fn stop(&self) {}
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            transport_state(RTCPeerConnectionState::Connected),
            Some(TransportState::Connected)
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(transport_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_contains_opus() {
        let peer = RtcPeerTransport::new(&[]).await.unwrap();
        peer.add_track(StubTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));
        assert!(peer.rtp_track(TrackKind::Audio).is_some());
        assert!(peer.rtp_track(TrackKind::Video).is_none());

        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_or_add_adds_missing_video() {
        let peer = RtcPeerTransport::new(&[]).await.unwrap();
        peer.add_track(StubTrack::new("mic", TrackKind::Audio))
            .await
            .unwrap();
        peer.replace_or_add_track(StubTrack::new("cam", TrackKind::Video))
            .await
            .unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_peers() {
        let caller = RtcPeerTransport::new(&[]).await.unwrap();
        let callee = RtcPeerTransport::new(&[]).await.unwrap();
        caller
            .add_track(StubTrack::new("a", TrackKind::Audio))
            .await
            .unwrap();
        callee
            .add_track(StubTrack::new("b", TrackKind::Audio))
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(offer.clone()).await.unwrap();
        callee.set_remote_description(offer).await.unwrap();

        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        callee.set_local_description(answer.clone()).await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_peer_reports_closed() {
        let peer = RtcPeerTransport::new(&[]).await.unwrap();
        peer.close().await.unwrap();

        assert_eq!(peer.create_offer().await, Err(PeerError::Closed));
    }
}
