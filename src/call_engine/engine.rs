//! Call Engine
//!
//! Hält die gemeinsamen Abhängigkeiten (Signaling, Medien, Peer Connections)
//! und die Konfiguration und erzeugt daraus pro Anruf eine `CallSession`.
//! Sessions teilen untereinander keinen Zustand.

use super::session::{CallSession, CallTarget, Collaborators, SessionParams};
use super::state::{CallError, CallRole, CallSummary};
use crate::config::EngineConfig;
use parking_lot::RwLock;

pub struct CallEngine {
    local_participant_id: String,
    collaborators: Collaborators,
    config: RwLock<EngineConfig>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        local_participant_id: impl Into<String>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            local_participant_id: local_participant_id.into(),
            collaborators,
            config: RwLock::new(config),
        }
    }

    pub fn local_participant_id(&self) -> &str {
        &self.local_participant_id
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Setzt optionale TURN-Server Credentials für alle folgenden Anrufe
    pub fn set_turn_server(&self, url: String, username: String, credential: String) {
        tracing::info!("Adding TURN server {}", url);
        self.config.write().add_turn_server(url, username, credential);
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Kehrt zurück, sobald das Offer gesendet ist. Schlägt der Aufbau fehl,
    /// ist die Session bereits beendet und `on_ended` wurde aufgerufen.
    pub async fn start_call(
        &self,
        target: CallTarget,
        wants_video: bool,
        on_ended: impl FnOnce(CallSummary) + Send + 'static,
    ) -> Result<CallSession, CallError> {
        let session = self
            .create_session(target, CallRole::Caller, wants_video, on_ended)
            .await?;
        session.start().await?;
        Ok(session)
    }

    /// Registriert einen eingehenden Anruf; die Session klingelt, bis
    /// `accept()` oder `decline()` kommt
    pub async fn incoming_call(
        &self,
        target: CallTarget,
        wants_video: bool,
        on_ended: impl FnOnce(CallSummary) + Send + 'static,
    ) -> Result<CallSession, CallError> {
        self.create_session(target, CallRole::Callee, wants_video, on_ended)
            .await
    }

    async fn create_session(
        &self,
        target: CallTarget,
        role: CallRole,
        wants_video: bool,
        on_ended: impl FnOnce(CallSummary) + Send + 'static,
    ) -> Result<CallSession, CallError> {
        let config = self.config();
        let params = SessionParams {
            local_participant_id: self.local_participant_id.clone(),
            target,
            role,
            wants_video,
        };
        CallSession::create(params, self.collaborators.clone(), &config, on_ended).await
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local_participant_id", &self.local_participant_id)
            .field("ice_servers", &self.config.read().ice_servers.len())
            .finish()
    }
}
