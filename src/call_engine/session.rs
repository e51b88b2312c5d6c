//! Call Session - Handle für einen einzelnen 1:1 Anruf
//!
//! Das Handle schickt Befehle an den Session-Task und liest den geteilten
//! Snapshot. Wird es verworfen, beendet sich der Anruf wie bei einem Hangup.

use super::actor::{ActorParts, Command, Event, OnEnded, Reply, SessionActor};
use super::media::MediaSource;
use super::peer::PeerTransportFactory;
use super::state::{CallError, CallEvent, CallRole, CallSnapshot, CallState, CallSummary};
use super::timer::CallTimer;
use crate::config::EngineConfig;
use crate::signaling::{SessionDescription, SignalingTransport};
use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Gegenseite eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    /// Chat, in dem angerufen wird; zugleich die Session-ID
    pub chat_id: String,
    pub remote_participant_id: String,
    pub is_group: bool,
}

impl CallTarget {
    pub fn direct(chat_id: impl Into<String>, remote_participant_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            remote_participant_id: remote_participant_id.into(),
            is_group: false,
        }
    }
}

/// Externe Abhängigkeiten einer Session
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerTransportFactory>,
}

/// Parameter für `CallSession::create`
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub local_participant_id: String,
    pub target: CallTarget,
    pub role: CallRole,
    pub wants_video: bool,
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    session_id: String,
    role: CallRole,
    commands: mpsc::UnboundedSender<Event>,
    shared: Arc<RwLock<CallSnapshot>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Erstellt eine Session und abonniert ihr Topic
    ///
    /// Kehrt erst zurück, wenn das Abo aktiv ist. Es wird noch nichts
    /// gesendet; der Anrufer muss `start()` aufrufen.
    pub async fn create(
        params: SessionParams,
        collaborators: Collaborators,
        config: &EngineConfig,
        on_ended: impl FnOnce(CallSummary) + Send + 'static,
    ) -> Result<Self, CallError> {
        if params.target.is_group {
            tracing::warn!("Rejecting group call in chat {}", params.target.chat_id);
            return Err(CallError::GroupCallUnsupported);
        }

        let session_id = params.target.chat_id.clone();
        let topic = config.topic(&session_id);

        tracing::info!(
            "Creating {} session for chat {} with {}",
            params.role,
            session_id,
            params.target.remote_participant_id
        );

        let subscription = collaborators.signaling.subscribe(&topic).await?;
        let subscription_id = subscription.id;
        let mut stream = subscription.stream;
        tracing::debug!("Subscribed to {} ({})", topic, subscription_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let started_at = Utc::now();

        let shared = Arc::new(RwLock::new(CallSnapshot {
            session_id: session_id.clone(),
            local_participant_id: params.local_participant_id.clone(),
            remote_participant_id: params.target.remote_participant_id.clone(),
            role: params.role,
            state: match params.role {
                CallRole::Caller => CallState::Calling,
                CallRole::Callee => CallState::Ringing,
            },
            wants_video: params.wants_video,
            muted: false,
            video_enabled: false,
            ever_connected: false,
            started_at,
            timer: CallTimer::new(),
        }));

        // Signaling -> Mailbox
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                if forward_tx.send(Event::Signal(message)).is_err() {
                    return;
                }
            }
            let _ = forward_tx.send(Event::SignalStreamEnded);
        });

        let ring_timer = config.ring_timeout().map(|timeout| {
            let timeout_tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timeout_tx.send(Event::RingTimeout);
            })
        });

        let on_ended: OnEnded = Box::new(on_ended);
        let actor = SessionActor::new(ActorParts {
            session_id: session_id.clone(),
            topic,
            subscription_id,
            local_participant_id: params.local_participant_id,
            role: params.role,
            wants_video: params.wants_video,
            started_at,
            signaling: collaborators.signaling,
            media_source: collaborators.media,
            peers: collaborators.peers,
            ice_servers: config.ice_servers.clone(),
            tx: tx.clone(),
            rx,
            shared: Arc::clone(&shared),
            events: events.clone(),
            on_ended,
            forwarder,
            ring_timer,
        });
        tokio::spawn(actor.run());

        Ok(Self {
            session_id,
            role: params.role,
            commands: tx,
            shared,
            events,
        })
    }

    /// Anrufer: Medien holen und Offer senden
    pub async fn start(&self) -> Result<(), CallError> {
        self.request(Command::Start).await
    }

    /// Angerufener nimmt an; ohne bisheriges Offer wird eines angefordert
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await
    }

    /// Angerufener verarbeitet ein Offer, das außerhalb der Session ankam;
    /// gilt als Annehmen
    pub async fn handle_remote_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        self.request(|reply| Command::HandleOffer(offer, reply)).await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(Command::Decline).await
    }

    /// Legt auf; auf einer bereits beendeten Session wirkungslos
    pub async fn hangup(&self) -> Result<(), CallError> {
        match self.request(Command::Hangup).await {
            Err(CallError::SessionClosed) => Ok(()),
            result => result,
        }
    }

    /// Gibt den neuen Mute-Status zurück
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleMute).await
    }

    /// Gibt zurück, ob Video danach aktiv ist
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleVideo).await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Event::Command(command(reply)))
            .map_err(|_| CallError::SessionClosed)?;
        response.await.map_err(|_| CallError::SessionClosed)?
    }

    // ========================================================================
    // LIVE STATE
    // ========================================================================

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.shared.read().state
    }

    pub fn is_muted(&self) -> bool {
        self.shared.read().muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.shared.read().video_enabled
    }

    pub fn duration_seconds(&self) -> u64 {
        self.shared.read().duration_seconds()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.shared.read().clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Event::Command(Command::Dispose));
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.read();
        f.debug_struct("CallSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("state", &snapshot.state)
            .field("is_muted", &snapshot.muted)
            .finish()
    }
}
