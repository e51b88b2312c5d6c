//! Schnittstelle zum Signaling-Kanal
//!
//! Der Kanal ist ein topic-basierter Broadcast mit at-least-once Zustellung
//! und ohne Reihenfolge-Garantie. Eine Session braucht davon nur drei
//! Operationen.

use super::messages::SignalMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling transport unreachable: {0}")]
    Unreachable(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Subscription to '{0}' was not confirmed in time")]
    SubscribeTimeout(String),

    #[error("Relay error: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("Invalid signaling frame: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Codec(e.to_string())
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Stream der Nachrichten eines Topics; endet mit `unsubscribe` oder
/// wenn der Transport die Verbindung verliert.
pub type SignalStream = BoxStream<'static, SignalMessage>;

/// Ein einzelnes Abo auf ein Topic
///
/// Mehrere Abos desselben Topics (z.B. zwei Sessions im selben Chat) sind
/// unabhängig; `unsubscribe` beendet nur das Abo mit dieser `id`.
pub struct Subscription {
    pub id: Uuid,
    pub topic: String,
    pub stream: SignalStream,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}

/// Topic-basierter Broadcast-Kanal
///
/// Zustellung an alle Abonnenten, eventuell auch zurück an den Absender.
/// Duplikate sind möglich.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Abonniert ein Topic. Kehrt erst zurück, wenn das Abo aktiv ist.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError>;

    /// Sendet eine Nachricht an alle Abonnenten des Topics.
    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), SignalingError>;

    /// Beendet genau dieses Abo; sein Stream endet, andere Abos des Topics
    /// bleiben bestehen.
    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), SignalingError>;
}
