//! Event-Loop einer Call Session
//!
//! Eine Session ist ein einzelner Task. Signaling-Nachrichten, Callbacks der
//! Peer Connection und Befehle des Besitzers landen in derselben Mailbox und
//! werden nacheinander abgearbeitet. Während eine lange Operation läuft
//! (Medien, SDP, Publish) liest `suspend` die Mailbox weiter: Auslöser für
//! das Beenden werden vorgemerkt, alles andere wird in Ankunftsreihenfolge
//! zurückgestellt.

use super::candidates::CandidateBuffer;
use super::media::{LocalMedia, LocalTrack, MediaSource};
use super::peer::{PeerTransport, PeerTransportFactory, RemoteTrackInfo, TransportState};
use super::state::{
    CallError, CallEvent, CallRole, CallSnapshot, CallState, CallSummary, EndReason,
};
use super::timer::CallTimer;
use crate::config::IceServerConfig;
use crate::signaling::{
    IceCandidate, SessionDescription, SignalKind, SignalMessage, SignalingError,
    SignalingTransport,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;
pub(crate) type OnEnded = Box<dyn FnOnce(CallSummary) + Send>;

/// Maximale Wartezeit für Hangup/Decline und Unsubscribe beim Beenden
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// EVENTS
// ============================================================================

/// Befehle des Besitzers
pub(crate) enum Command {
    Start(Reply<()>),
    Accept(Reply<()>),
    HandleOffer(SessionDescription, Reply<()>),
    Decline(Reply<()>),
    Hangup(Reply<()>),
    ToggleMute(Reply<bool>),
    ToggleVideo(Reply<bool>),
    Dispose,
}

/// Callbacks der Peer Connection
pub(crate) enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChange(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

pub(crate) enum Event {
    Signal(SignalMessage),
    SignalStreamEnded,
    Peer(PeerEvent),
    Command(Command),
    RingTimeout,
}

/// Vorgemerktes Ende eines Anrufs
struct Teardown {
    final_state: CallState,
    reason: EndReason,
    error: Option<CallError>,
}

impl Teardown {
    fn ended(reason: EndReason) -> Self {
        Self {
            final_state: CallState::Ended,
            reason,
            error: None,
        }
    }

    fn declined(reason: EndReason) -> Self {
        Self {
            final_state: CallState::Declined,
            reason,
            error: None,
        }
    }

    fn peer_lost() -> Self {
        Self {
            final_state: CallState::Ended,
            reason: EndReason::PeerDisconnected,
            error: Some(CallError::PeerDisconnected),
        }
    }

    fn failed(error: CallError) -> Self {
        Self {
            final_state: CallState::Ended,
            reason: EndReason::Failed,
            error: Some(error),
        }
    }

    /// Welche Nachricht die Gegenseite beim Beenden bekommt
    fn farewell(&self, role: CallRole) -> Option<SignalKind> {
        match self.reason {
            EndReason::LocalHangup | EndReason::Disposed | EndReason::Failed => {
                Some(SignalKind::Hangup)
            }
            EndReason::LocalDecline => Some(SignalKind::Decline),
            EndReason::RingTimeout if role == CallRole::Caller => Some(SignalKind::Hangup),
            _ => None,
        }
    }
}

// ============================================================================
// SESSION ACTOR
// ============================================================================

pub(crate) struct ActorParts {
    pub session_id: String,
    pub topic: String,
    pub subscription_id: Uuid,
    pub local_participant_id: String,
    pub role: CallRole,
    pub wants_video: bool,
    pub started_at: DateTime<Utc>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub media_source: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerTransportFactory>,
    pub ice_servers: Vec<IceServerConfig>,
    pub tx: mpsc::UnboundedSender<Event>,
    pub rx: mpsc::UnboundedReceiver<Event>,
    pub shared: Arc<RwLock<CallSnapshot>>,
    pub events: broadcast::Sender<CallEvent>,
    pub on_ended: OnEnded,
    pub forwarder: JoinHandle<()>,
    pub ring_timer: Option<JoinHandle<()>>,
}

pub(crate) struct SessionActor {
    session_id: String,
    topic: String,
    subscription_id: Uuid,
    local_participant_id: String,
    role: CallRole,
    started_at: DateTime<Utc>,

    state: CallState,
    wants_video: bool,
    muted: bool,
    timer: CallTimer,
    ever_connected: bool,
    closed: bool,

    started: bool,
    accepted: bool,
    offer_handled: bool,
    pending_offer: Option<SessionDescription>,
    local_offer: Option<SessionDescription>,
    remote_description_set: bool,
    candidates: CandidateBuffer,

    media: Option<LocalMedia>,
    peer: Option<Arc<dyn PeerTransport>>,

    signaling: Arc<dyn SignalingTransport>,
    media_source: Arc<dyn MediaSource>,
    peers: Arc<dyn PeerTransportFactory>,
    ice_servers: Vec<IceServerConfig>,

    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    deferred: VecDeque<Event>,
    abort: Option<Teardown>,
    waiting: Vec<Reply<()>>,

    shared: Arc<RwLock<CallSnapshot>>,
    events: broadcast::Sender<CallEvent>,
    on_ended: Option<OnEnded>,
    forwarder: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl SessionActor {
    pub(crate) fn new(parts: ActorParts) -> Self {
        let state = match parts.role {
            CallRole::Caller => CallState::Calling,
            CallRole::Callee => CallState::Ringing,
        };

        Self {
            session_id: parts.session_id,
            topic: parts.topic,
            subscription_id: parts.subscription_id,
            local_participant_id: parts.local_participant_id,
            role: parts.role,
            started_at: parts.started_at,
            state,
            wants_video: parts.wants_video,
            muted: false,
            timer: CallTimer::new(),
            ever_connected: false,
            closed: false,
            started: false,
            accepted: false,
            offer_handled: false,
            pending_offer: None,
            local_offer: None,
            remote_description_set: false,
            candidates: CandidateBuffer::new(),
            media: None,
            peer: None,
            signaling: parts.signaling,
            media_source: parts.media_source,
            peers: parts.peers,
            ice_servers: parts.ice_servers,
            tx: parts.tx,
            rx: parts.rx,
            deferred: VecDeque::new(),
            abort: None,
            waiting: Vec::new(),
            shared: parts.shared,
            events: parts.events,
            on_ended: Some(parts.on_ended),
            forwarder: Some(parts.forwarder),
            ring_timer: parts.ring_timer,
        }
    }

    /// Läuft bis zum Ende des Anrufs
    pub(crate) async fn run(mut self) {
        tracing::info!(
            "Call {} started as {} (video: {})",
            self.session_id,
            self.role,
            self.wants_video
        );

        while !self.closed {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => match self.rx.recv().await {
                    Some(event) => event,
                    None => Event::Command(Command::Dispose),
                },
            };
            self.dispatch(event).await;

            if let Some(teardown) = self.abort.take() {
                self.teardown(teardown).await;
            }
        }

        tracing::debug!("Call {} actor stopped", self.session_id);
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Signal(message) => {
                let result = self.on_signal(message).await;
                let _ = self.settle(result).await;
            }
            Event::SignalStreamEnded => self.on_signal_stream_ended().await,
            Event::Peer(event) => {
                let result = self.on_peer_event(event).await;
                let _ = self.settle(result).await;
            }
            Event::Command(command) => self.on_command(command).await,
            Event::RingTimeout => {
                if self.is_unanswered() {
                    tracing::info!("Call {} was not answered in time", self.session_id);
                    self.teardown(Teardown::ended(EndReason::RingTimeout)).await;
                }
            }
        }
    }

    // ========================================================================
    // SUSPENSION
    // ========================================================================

    /// Wartet auf `op` und liest dabei die Mailbox weiter
    async fn suspend<T>(&mut self, op: impl Future<Output = T>) -> T {
        tokio::pin!(op);
        loop {
            let event = tokio::select! {
                biased;
                output = &mut op => return output,
                event = self.rx.recv() => event,
            };
            match event {
                Some(event) => self.intercept(event),
                None => return op.await,
            }
        }
    }

    /// Ordnet ein Event ein, das während einer laufenden Operation eintrifft
    fn intercept(&mut self, event: Event) {
        let trigger = match &event {
            Event::Command(Command::Dispose) => Some(Teardown::ended(EndReason::Disposed)),
            Event::Command(Command::Hangup(_)) => Some(Teardown::ended(EndReason::LocalHangup)),
            Event::Signal(message) if message.from() != self.local_participant_id => {
                match message.kind() {
                    SignalKind::Hangup => Some(Teardown::ended(EndReason::RemoteHangup)),
                    SignalKind::Decline => Some(Teardown::declined(EndReason::RemoteDecline)),
                    _ => None,
                }
            }
            Event::Peer(PeerEvent::StateChange(state)) if state.is_lost() => {
                Some(Teardown::peer_lost())
            }
            Event::RingTimeout if self.is_unanswered() => {
                Some(Teardown::ended(EndReason::RingTimeout))
            }
            Event::SignalStreamEnded if !self.ever_connected => {
                Some(Teardown::failed(signaling_lost()))
            }
            _ => None,
        };

        match trigger {
            Some(teardown) => {
                tracing::debug!(
                    "Call {}: {:?} arrived during a pending operation",
                    self.session_id,
                    teardown.reason
                );
                if let Event::Command(Command::Hangup(reply)) = event {
                    self.waiting.push(reply);
                }
                if self.abort.is_none() {
                    self.abort = Some(teardown);
                }
            }
            None => self.deferred.push_back(event),
        }
    }

    fn check_interrupted(&self) -> Result<(), CallError> {
        if self.abort.is_some() || self.closed {
            return Err(CallError::Interrupted);
        }
        Ok(())
    }

    /// Abschluss einer Operation: vorgemerktes Ende ausführen oder Fehler zum
    /// Ende machen
    async fn settle(&mut self, result: Result<(), CallError>) -> Result<(), CallError> {
        if let Some(teardown) = self.abort.take() {
            self.teardown(teardown).await;
            return Err(CallError::Interrupted);
        }
        match result {
            Err(CallError::Interrupted) if self.closed => Err(CallError::Interrupted),
            Err(e) => {
                if !self.closed {
                    tracing::error!("Call {} failed: {}", self.session_id, e);
                    self.teardown(Teardown::failed(e.clone())).await;
                }
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = match self.require(CallRole::Caller, "start") {
                    Ok(()) if self.started => Err(self.invalid("start")),
                    Ok(()) => {
                        let result = self.start_outgoing().await;
                        self.settle(result).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Accept(reply) => {
                let result = match self.require(CallRole::Callee, "accept") {
                    Ok(()) if self.state != CallState::Ringing => Err(self.invalid("accept")),
                    Ok(()) if self.accepted => Ok(()),
                    Ok(()) => {
                        let result = self.accept().await;
                        self.settle(result).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::HandleOffer(offer, reply) => {
                let result = match self.require(CallRole::Callee, "handle an offer") {
                    Ok(()) if self.offer_handled => Ok(()),
                    Ok(()) if self.state != CallState::Ringing => {
                        Err(self.invalid("handle an offer"))
                    }
                    Ok(()) => {
                        self.accepted = true;
                        self.stop_ring_timer();
                        self.pending_offer = None;
                        let result = self.answer_offer(offer).await;
                        self.settle(result).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Decline(reply) => {
                let result = match self.require(CallRole::Callee, "decline") {
                    Ok(()) if self.state != CallState::Ringing => Err(self.invalid("decline")),
                    Ok(()) => {
                        tracing::info!("Declining call {}", self.session_id);
                        self.teardown(Teardown::declined(EndReason::LocalDecline))
                            .await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Hangup(reply) => {
                tracing::info!("Hanging up call {}", self.session_id);
                self.waiting.push(reply);
                self.teardown(Teardown::ended(EndReason::LocalHangup)).await;
            }
            Command::ToggleMute(reply) => {
                self.muted = !self.muted;
                if let Some(media) = &self.media {
                    media.audio.set_enabled(!self.muted);
                }
                let muted = self.muted;
                self.shared.write().muted = muted;
                let _ = self.events.send(CallEvent::MuteChanged(muted));
                let _ = reply.send(Ok(muted));
            }
            Command::ToggleVideo(reply) => {
                let enabled = self.toggle_video().await;
                let _ = reply.send(Ok(enabled));
            }
            Command::Dispose => {
                self.teardown(Teardown::ended(EndReason::Disposed)).await;
            }
        }
    }

    fn require(&self, role: CallRole, operation: &'static str) -> Result<(), CallError> {
        if self.role != role {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Anrufer: Medien, Peer Connection, Offer
    async fn start_outgoing(&mut self) -> Result<(), CallError> {
        self.started = true;

        self.acquire_media().await?;
        let peer = self.create_peer().await?;
        self.attach_tracks(&peer).await?;

        let pc = Arc::clone(&peer);
        let offer = self.suspend(async move { pc.create_offer().await }).await?;
        self.check_interrupted()?;

        let pc = Arc::clone(&peer);
        let local = offer.clone();
        self.suspend(async move { pc.set_local_description(local).await })
            .await?;
        self.local_offer = Some(offer.clone());
        self.check_interrupted()?;

        let message = SignalMessage::offer(self.local_participant_id.clone(), offer, self.wants_video);
        self.publish(message).await?;
        tracing::info!("Offer sent for call {}", self.session_id);

        self.check_interrupted()
    }

    /// Angerufener nimmt an
    async fn accept(&mut self) -> Result<(), CallError> {
        self.accepted = true;
        self.stop_ring_timer();
        match self.pending_offer.take() {
            Some(offer) => self.answer_offer(offer).await,
            None => {
                tracing::info!(
                    "Call {} accepted before an offer arrived, requesting it",
                    self.session_id
                );
                let message = SignalMessage::request_offer(self.local_participant_id.clone());
                self.publish(message).await?;
                self.check_interrupted()
            }
        }
    }

    /// Angerufener: Offer anwenden und Answer senden
    async fn answer_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        self.offer_handled = true;
        self.transition(CallState::Connecting);

        self.acquire_media().await?;
        let peer = self.create_peer().await?;
        self.attach_tracks(&peer).await?;

        let pc = Arc::clone(&peer);
        self.suspend(async move { pc.set_remote_description(offer).await })
            .await?;
        self.remote_description_set = true;
        self.check_interrupted()?;

        self.flush_candidates(&peer).await?;

        let pc = Arc::clone(&peer);
        let answer = self.suspend(async move { pc.create_answer().await }).await?;
        self.check_interrupted()?;

        let pc = Arc::clone(&peer);
        let local = answer.clone();
        self.suspend(async move { pc.set_local_description(local).await })
            .await?;
        self.check_interrupted()?;

        let message = SignalMessage::answer(self.local_participant_id.clone(), answer);
        self.publish(message).await?;
        tracing::info!("Answer sent for call {}", self.session_id);

        self.check_interrupted()
    }

    /// Kamera ein/aus; fehlt ein Video-Track, wird einer nachgeladen
    async fn toggle_video(&mut self) -> bool {
        let existing = self.media.as_ref().map(|m| m.video.clone());

        let enabled = match existing {
            // Noch keine Medien: nur den Wunsch merken
            None => {
                self.wants_video = !self.wants_video;
                self.shared.write().wants_video = self.wants_video;
                self.wants_video
            }
            Some(Some(video)) => {
                let enabled = !video.is_enabled();
                video.set_enabled(enabled);
                enabled
            }
            Some(None) => self.add_video_track().await,
        };

        self.shared.write().video_enabled = self.video_enabled();
        let _ = self.events.send(CallEvent::VideoChanged(enabled));
        enabled
    }

    async fn add_video_track(&mut self) -> bool {
        let source = Arc::clone(&self.media_source);
        let track = match self.suspend(async move { source.acquire_video().await }).await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Camera unavailable, video stays off: {}", e);
                return false;
            }
        };

        if let Some(media) = self.media.as_mut() {
            media.video = Some(Arc::clone(&track));
        }
        if self.check_interrupted().is_err() {
            return false;
        }

        if let Some(peer) = self.peer.clone() {
            let attached = Arc::clone(&track);
            if let Err(e) = self
                .suspend(async move { peer.replace_or_add_track(attached).await })
                .await
            {
                tracing::warn!("Failed to attach video track: {}", e);
                track.stop();
                if let Some(media) = self.media.as_mut() {
                    media.video = None;
                }
                return false;
            }
        }

        self.wants_video = true;
        self.shared.write().wants_video = true;
        true
    }

    fn video_enabled(&self) -> bool {
        self.media
            .as_ref()
            .and_then(|m| m.video.as_ref())
            .map(|v| v.is_enabled())
            .unwrap_or(false)
    }

    // ========================================================================
    // SETUP STEPS
    // ========================================================================

    async fn acquire_media(&mut self) -> Result<(), CallError> {
        let source = Arc::clone(&self.media_source);
        let wants_video = self.wants_video;
        let result = self
            .suspend(async move { source.acquire(wants_video).await })
            .await;

        let media = match result {
            Ok(media) => media,
            Err(e) if wants_video && e.is_recoverable() => {
                tracing::warn!("{}, continuing audio-only", e);
                self.check_interrupted()?;
                let source = Arc::clone(&self.media_source);
                self.suspend(async move { source.acquire(false).await })
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        media.audio.set_enabled(!self.muted);
        let has_video = media.video.is_some();
        self.media = Some(media);

        if self.wants_video && !has_video {
            self.wants_video = false;
        }
        {
            let mut shared = self.shared.write();
            shared.wants_video = self.wants_video;
            shared.video_enabled = has_video;
        }

        self.check_interrupted()
    }

    async fn create_peer(&mut self) -> Result<Arc<dyn PeerTransport>, CallError> {
        let factory = Arc::clone(&self.peers);
        let ice_servers = self.ice_servers.clone();
        let peer = self
            .suspend(async move { factory.create(&ice_servers).await })
            .await?;

        self.register_callbacks(&peer);
        self.peer = Some(Arc::clone(&peer));
        self.check_interrupted()?;
        Ok(peer)
    }

    fn register_callbacks(&self, peer: &Arc<dyn PeerTransport>) {
        let tx = self.tx.clone();
        peer.on_local_candidate(Box::new(move |candidate| {
            let _ = tx.send(Event::Peer(PeerEvent::LocalCandidate(candidate)));
        }));

        let tx = self.tx.clone();
        peer.on_connection_state_change(Box::new(move |state| {
            let _ = tx.send(Event::Peer(PeerEvent::StateChange(state)));
        }));

        let tx = self.tx.clone();
        peer.on_remote_track(Box::new(move |track| {
            let _ = tx.send(Event::Peer(PeerEvent::RemoteTrack(track)));
        }));
    }

    async fn attach_tracks(&mut self, peer: &Arc<dyn PeerTransport>) -> Result<(), CallError> {
        let tracks: Vec<Arc<dyn LocalTrack>> =
            self.media.as_ref().map(LocalMedia::tracks).unwrap_or_default();

        for track in tracks {
            tracing::debug!("Adding local {} track {}", track.kind(), track.id());
            let pc = Arc::clone(peer);
            self.suspend(async move { pc.add_track(track).await }).await?;
            self.check_interrupted()?;
        }
        Ok(())
    }

    /// Wendet gepufferte Candidates an, sobald die Remote Description steht
    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerTransport>) -> Result<(), CallError> {
        let buffered = self.candidates.drain_if_ready(self.remote_description_set);
        if !buffered.is_empty() {
            tracing::debug!("Applying {} buffered ICE candidates", buffered.len());
        }
        for candidate in buffered {
            self.apply_candidate(peer, candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(
        &mut self,
        peer: &Arc<dyn PeerTransport>,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let pc = Arc::clone(peer);
        self.suspend(async move { pc.add_ice_candidate(candidate).await })
            .await?;
        self.check_interrupted()
    }

    async fn publish(&mut self, message: SignalMessage) -> Result<(), CallError> {
        let signaling = Arc::clone(&self.signaling);
        let topic = self.topic.clone();
        tracing::debug!("Publishing {} on {}", message.kind(), topic);
        self.suspend(async move { signaling.publish(&topic, message).await })
            .await?;
        Ok(())
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_signal(&mut self, message: SignalMessage) -> Result<(), CallError> {
        if message.from() == self.local_participant_id {
            tracing::trace!("Ignoring own {} signal", message.kind());
            return Ok(());
        }
        tracing::debug!("Call {} received {}", self.session_id, message.kind());

        match message {
            SignalMessage::Offer { payload, video, .. } => {
                self.on_remote_offer(payload, video).await
            }
            SignalMessage::Answer { payload, .. } => self.on_remote_answer(payload).await,
            SignalMessage::Candidate { payload, .. } => self.on_remote_candidate(payload).await,
            SignalMessage::RequestOffer { .. } => self.on_offer_requested().await,
            SignalMessage::Hangup { .. } => {
                tracing::info!("Remote party hung up call {}", self.session_id);
                self.teardown(Teardown::ended(EndReason::RemoteHangup)).await;
                Ok(())
            }
            SignalMessage::Decline { .. } => {
                tracing::info!("Remote party declined call {}", self.session_id);
                self.teardown(Teardown::declined(EndReason::RemoteDecline))
                    .await;
                Ok(())
            }
        }
    }

    async fn on_remote_offer(
        &mut self,
        offer: SessionDescription,
        video: bool,
    ) -> Result<(), CallError> {
        if self.role == CallRole::Caller {
            tracing::warn!("Caller ignores offer on call {}", self.session_id);
            return Ok(());
        }
        if self.offer_handled || self.pending_offer.is_some() || self.state != CallState::Ringing {
            tracing::debug!("Duplicate offer ignored");
            return Ok(());
        }

        if self.accepted {
            // Angenommen und auf das angeforderte Offer gewartet
            return self.answer_offer(offer).await;
        }
        self.pending_offer = Some(offer);
        let _ = self.events.send(CallEvent::OfferReceived { video });
        Ok(())
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        if self.role == CallRole::Callee {
            tracing::warn!("Callee ignores answer on call {}", self.session_id);
            return Ok(());
        }
        if self.remote_description_set {
            tracing::debug!("Duplicate answer ignored");
            return Ok(());
        }
        let Some(peer) = self.peer.clone() else {
            tracing::warn!("Answer arrived before an offer was sent");
            return Ok(());
        };

        let pc = Arc::clone(&peer);
        self.suspend(async move { pc.set_remote_description(answer).await })
            .await?;
        self.remote_description_set = true;
        self.check_interrupted()?;

        self.flush_candidates(&peer).await
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        match self.peer.clone() {
            Some(peer) if self.remote_description_set => self.apply_candidate(&peer, candidate).await,
            _ => {
                self.candidates.push(candidate);
                tracing::debug!("Buffered ICE candidate ({} pending)", self.candidates.len());
                Ok(())
            }
        }
    }

    async fn on_offer_requested(&mut self) -> Result<(), CallError> {
        if self.role != CallRole::Caller || self.remote_description_set {
            return Ok(());
        }
        let Some(offer) = self.local_offer.clone() else {
            tracing::debug!("Offer requested before it was created");
            return Ok(());
        };

        tracing::info!("Re-sending offer for call {}", self.session_id);
        let message = SignalMessage::offer(self.local_participant_id.clone(), offer, self.wants_video);
        self.publish(message).await
    }

    async fn on_signal_stream_ended(&mut self) {
        if self.ever_connected {
            tracing::warn!(
                "Signaling for call {} closed, media continues peer-to-peer",
                self.session_id
            );
            return;
        }
        tracing::error!("Signaling for call {} closed during setup", self.session_id);
        self.teardown(Teardown::failed(signaling_lost())).await;
    }

    // ========================================================================
    // PEER EVENTS
    // ========================================================================

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), CallError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::candidate(self.local_participant_id.clone(), candidate);
                match self.publish(message).await {
                    Err(CallError::SignalingUnreachable(e)) if self.ever_connected => {
                        tracing::warn!("Failed to publish ICE candidate: {}", e);
                        Ok(())
                    }
                    result => result,
                }
            }
            PeerEvent::StateChange(state) => {
                tracing::info!("Peer connection state: {}", state);
                if state == TransportState::Connected {
                    self.on_connected();
                } else if state.is_lost() {
                    self.teardown(Teardown::peer_lost()).await;
                }
                Ok(())
            }
            PeerEvent::RemoteTrack(track) => {
                tracing::info!("Received remote {} track {}", track.kind, track.id);
                let _ = self.events.send(CallEvent::RemoteTrack(track));
                Ok(())
            }
        }
    }

    fn on_connected(&mut self) {
        if !self.transition(CallState::Connected) {
            return;
        }
        self.ever_connected = true;
        self.timer.start(Instant::now());
        self.stop_ring_timer();

        let mut shared = self.shared.write();
        shared.ever_connected = true;
        shared.timer = self.timer;
    }

    // ========================================================================
    // STATE & TEARDOWN
    // ========================================================================

    /// Weder verbunden noch vom Angerufenen angenommen
    fn is_unanswered(&self) -> bool {
        self.state.is_pending() && !self.accepted
    }

    fn stop_ring_timer(&mut self) {
        if let Some(ring_timer) = self.ring_timer.take() {
            ring_timer.abort();
        }
    }

    fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                "Call {}: ignoring transition {} -> {}",
                self.session_id,
                self.state,
                next
            );
            return false;
        }

        tracing::info!("Call {}: {} -> {}", self.session_id, self.state, next);
        self.state = next;
        self.shared.write().state = next;
        let _ = self.events.send(CallEvent::StateChanged(next));
        true
    }

    /// Beendet den Anruf; jeder weitere Aufruf ist wirkungslos
    async fn teardown(&mut self, teardown: Teardown) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.abort = None;

        self.stop_ring_timer();
        let duration_seconds = self.timer.stop();

        let final_state = if self.state.can_transition_to(teardown.final_state) {
            teardown.final_state
        } else {
            CallState::Ended
        };
        self.transition(final_state);

        if let Some(kind) = teardown.farewell(self.role) {
            let from = self.local_participant_id.clone();
            let message = match kind {
                SignalKind::Decline => SignalMessage::decline(from),
                _ => SignalMessage::hangup(from),
            };
            let signaling = Arc::clone(&self.signaling);
            let topic = self.topic.clone();
            match tokio::time::timeout(FAREWELL_TIMEOUT, signaling.publish(&topic, message)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Could not send {} for call {}: {}", kind, self.session_id, e)
                }
                Err(_) => tracing::warn!(
                    "Sending {} for call {} timed out",
                    kind,
                    self.session_id
                ),
            }
        }

        if let Some(media) = self.media.take() {
            media.stop();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let signaling = Arc::clone(&self.signaling);
        let topic = self.topic.clone();
        let subscription_id = self.subscription_id;
        match tokio::time::timeout(
            FAREWELL_TIMEOUT,
            signaling.unsubscribe(&topic, subscription_id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to unsubscribe from {}: {}", topic, e),
            Err(_) => tracing::warn!("Unsubscribe from {} timed out", topic),
        }

        let summary = CallSummary {
            session_id: self.session_id.clone(),
            role: self.role,
            duration_seconds,
            ever_connected: self.ever_connected,
            wants_video: self.wants_video,
            final_state: self.state,
            reason: teardown.reason,
            error: teardown.error,
            started_at: self.started_at,
            ended_at: Utc::now(),
        };
        tracing::info!(
            "Call {} ended ({:?}): {}",
            self.session_id,
            summary.reason,
            summary.status_text()
        );

        {
            let mut shared = self.shared.write();
            shared.timer = self.timer;
            shared.muted = self.muted;
            shared.video_enabled = false;
        }
        let _ = self.events.send(CallEvent::Ended(summary.clone()));

        if let Some(on_ended) = self.on_ended.take() {
            on_ended(summary);
        }
        for reply in self.waiting.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }
}

fn signaling_lost() -> CallError {
    CallError::SignalingUnreachable(SignalingError::Unreachable(
        "subscription closed".to_string(),
    ))
}
