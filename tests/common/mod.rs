//! In-Memory Fakes für Medienquelle und Peer Connection
#![allow(dead_code)]

use async_trait::async_trait;
use call_negotiator::call_engine::{
    CallSession, CallState, CallSummary, CallTarget, Collaborators, ConnectionStateHandler,
    LocalCandidateHandler, LocalMedia, LocalTrack, MediaError, MediaSource, PeerError,
    PeerTransport, PeerTransportFactory, RemoteTrackHandler, RemoteTrackInfo, TrackKind,
    TransportState,
};
use call_negotiator::config::{EngineConfig, IceServerConfig};
use call_negotiator::signaling::{
    IceCandidate, LocalHub, SdpKind, SessionDescription, SignalKind, SignalMessage, SignalStream,
    SignalingError, SignalingTransport, Subscription,
};
use call_negotiator::CallEngine;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

pub const CHAT: &str = "chat-1";
pub const TOPIC: &str = "call:chat-1";

// ============================================================================
// MEDIA
// ============================================================================

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocalTrack for FakeTrack {
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

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeMedia {
    camera: AtomicBool,
    microphone: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    requests: Mutex<Vec<bool>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            camera: AtomicBool::new(true),
            microphone: AtomicBool::new(true),
            gate: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_camera(&self, available: bool) {
        self.camera.store(available, Ordering::SeqCst);
    }

    pub fn set_microphone(&self, available: bool) {
        self.microphone.store(available, Ordering::SeqCst);
    }

    /// `acquire` wartet, bis der zurückgegebene Notify ausgelöst wird
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Bisherige `acquire(wants_video)`-Aufrufe
    pub fn requests(&self) -> Vec<bool> {
        self.requests.lock().clone()
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    fn track(&self, kind: TrackKind) -> Arc<FakeTrack> {
        let mut tracks = self.tracks.lock();
        let track = Arc::new(FakeTrack {
            id: format!("{}-{}", kind, tracks.len()),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        });
        tracks.push(Arc::clone(&track));
        track
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, wants_video: bool) -> Result<LocalMedia, MediaError> {
        self.requests.lock().push(wants_video);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if !self.microphone.load(Ordering::SeqCst) {
            return Err(MediaError::AudioUnavailable("permission denied".into()));
        }
        if wants_video && !self.camera.load(Ordering::SeqCst) {
            return Err(MediaError::VideoUnavailable("no camera".into()));
        }

        let audio: Arc<dyn LocalTrack> = self.track(TrackKind::Audio);
        let video = wants_video.then(|| self.track(TrackKind::Video) as Arc<dyn LocalTrack>);
        Ok(LocalMedia { audio, video })
    }

    async fn acquire_video(&self) -> Result<Arc<dyn LocalTrack>, MediaError> {
        if !self.camera.load(Ordering::SeqCst) {
            return Err(MediaError::VideoUnavailable("no camera".into()));
        }
        Ok(self.track(TrackKind::Video))
    }
}

// ============================================================================
// PEER
// ============================================================================

#[derive(Default)]
pub struct FakePeer {
    local_candidate: Mutex<Option<LocalCandidateHandler>>,
    remote_track: Mutex<Option<RemoteTrackHandler>>,
    state: Mutex<Option<ConnectionStateHandler>>,

    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<TrackKind>>,
    replaced: Mutex<Vec<TrackKind>>,
    offers: AtomicUsize,
    closes: AtomicUsize,
    remote_gate: Mutex<Option<Arc<Notify>>>,
    reject_candidates: AtomicBool,
}

impl FakePeer {
    pub fn emit_state(&self, state: TransportState) {
        if let Some(handler) = self.state.lock().as_ref() {
            handler(state);
        }
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        if let Some(handler) = self.local_candidate.lock().as_ref() {
            handler(candidate);
        }
    }

    pub fn emit_remote_track(&self, kind: TrackKind) {
        if let Some(handler) = self.remote_track.lock().as_ref() {
            handler(RemoteTrackInfo {
                id: format!("remote-{}", kind),
                kind,
            });
        }
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.tracks.lock().clone()
    }

    pub fn replaced(&self) -> Vec<TrackKind> {
        self.replaced.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reject_candidates(&self) {
        self.reject_candidates.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote.lock().is_none() {
            return Err(PeerError::InvalidSdp("no remote offer".into()));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let gate = self.remote_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidSdp(desc.sdp));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote.lock().is_none() {
            return Err(PeerError::WebRTC("remote description not set".into()));
        }
        if self.reject_candidates.load(Ordering::SeqCst) {
            return Err(PeerError::WebRTC("candidate rejected".into()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        self.tracks.lock().push(track.kind());
        Ok(())
    }

    async fn replace_or_add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        self.replaced.lock().push(track.kind());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_local_candidate(&self, handler: LocalCandidateHandler) {
        *self.local_candidate.lock() = Some(handler);
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.remote_track.lock() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        *self.state.lock() = Some(handler);
    }
}

#[derive(Default)]
pub struct FakePeers {
    created: Mutex<Vec<Arc<FakePeer>>>,
    remote_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakePeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Neue Peers warten in `set_remote_description` auf den Notify
    pub fn hold_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.remote_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn nth(&self, n: usize) -> Arc<FakePeer> {
        Arc::clone(&self.created.lock()[n])
    }

    pub fn last(&self) -> Arc<FakePeer> {
        let created = self.created.lock();
        Arc::clone(created.last().expect("no peer created"))
    }
}

#[async_trait]
impl PeerTransportFactory for FakePeers {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let peer = Arc::new(FakePeer::default());
        *peer.remote_gate.lock() = self.remote_gate.lock().clone();
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub hub: LocalHub,
    pub media: Arc<FakeMedia>,
    pub peers: Arc<FakePeers>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            hub: LocalHub::new(),
            media: FakeMedia::new(),
            peers: FakePeers::new(),
        }
    }

    pub fn collaborators(&self, participant_id: &str) -> Collaborators {
        Collaborators {
            signaling: self.hub.endpoint(participant_id),
            media: self.media.clone(),
            peers: self.peers.clone(),
        }
    }

    pub fn engine(&self, participant_id: &str) -> CallEngine {
        self.engine_with(participant_id, test_config())
    }

    pub fn engine_with(&self, participant_id: &str, config: EngineConfig) -> CallEngine {
        CallEngine::new(participant_id, self.collaborators(participant_id), config)
    }

    /// Roher Teilnehmer ohne Session, abonniert auf das Topic
    pub async fn remote(&self, participant_id: &str) -> Remote {
        let endpoint = self.hub.endpoint(participant_id);
        let stream = SignalingTransport::subscribe(endpoint.as_ref(), TOPIC)
            .await
            .unwrap()
            .stream;
        Remote {
            id: participant_id.to_string(),
            endpoint,
            stream,
        }
    }
}

// ============================================================================
// STALLING SIGNALING
// ============================================================================

/// Signaling, dessen Publish und Unsubscribe auf Wunsch nie fertig werden
pub struct StallingSignaling {
    inner: Arc<dyn SignalingTransport>,
    stalled: AtomicBool,
}

impl StallingSignaling {
    pub fn new(inner: Arc<dyn SignalingTransport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            stalled: AtomicBool::new(false),
        })
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    async fn gate(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl SignalingTransport for StallingSignaling {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        self.inner.subscribe(topic).await
    }

    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), SignalingError> {
        self.gate().await;
        self.inner.publish(topic, message).await
    }

    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), SignalingError> {
        self.gate().await;
        self.inner.unsubscribe(topic, id).await
    }
}

/// Ohne Klingel-Timeout, damit pausierte Uhren ihn nicht auslösen
pub fn test_config() -> EngineConfig {
    EngineConfig {
        ring_timeout_secs: None,
        ..EngineConfig::default()
    }
}

pub fn target(remote: &str) -> CallTarget {
    CallTarget::direct(CHAT, remote)
}

pub struct Remote {
    pub id: String,
    pub endpoint: Arc<call_negotiator::signaling::HubEndpoint>,
    stream: SignalStream,
}

impl Remote {
    pub async fn send(&self, message: SignalMessage) {
        SignalingTransport::publish(
            self.endpoint.as_ref(),
            TOPIC,
            message,
        )
        .await
        .unwrap();
    }

    pub async fn send_answer(&self) {
        self.send(SignalMessage::answer(
            self.id.clone(),
            SessionDescription::answer("v=0 remote-answer"),
        ))
        .await;
    }

    pub async fn send_offer(&self, video: bool) {
        self.send(SignalMessage::offer(
            self.id.clone(),
            SessionDescription::offer("v=0 remote-offer"),
            video,
        ))
        .await;
    }

    pub async fn send_candidate(&self, n: u32) {
        self.send(SignalMessage::candidate(self.id.clone(), candidate(n)))
            .await;
    }

    /// Nächste Nachricht eines Typs von jemand anderem
    pub async fn expect(&mut self, kind: SignalKind) -> SignalMessage {
        loop {
            let message = self.stream.next().await.expect("signal stream ended");
            if message.from() != self.id && message.kind() == kind {
                return message;
            }
        }
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
}

pub fn is_offer(desc: &SessionDescription) -> bool {
    desc.kind == SdpKind::Offer
}

// ============================================================================
// WAITING
// ============================================================================

/// Empfängt die `on_ended`-Meldung
pub struct EndedReceiver {
    rx: mpsc::UnboundedReceiver<CallSummary>,
}

impl EndedReceiver {
    pub async fn next(&mut self) -> CallSummary {
        self.rx.recv().await.expect("on_ended sender dropped")
    }

    pub fn try_next(&mut self) -> Option<CallSummary> {
        self.rx.try_recv().ok()
    }
}

pub fn ended_channel() -> (impl FnOnce(CallSummary) + Send + 'static, EndedReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_ended = move |summary: CallSummary| {
        let _ = tx.send(summary);
    };
    (on_ended, EndedReceiver { rx })
}

/// Lässt alle anderen Tasks laufen, bis die Bedingung gilt
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub async fn wait_for_state(session: &CallSession, state: CallState) {
    wait_until(|| session.state() == state).await;
}

/// Gibt anderen Tasks Gelegenheit, anstehende Nachrichten abzuarbeiten
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}
