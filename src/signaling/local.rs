//! In-Process Signaling Hub
//!
//! Topic-basierter Broadcast innerhalb eines Prozesses. Verhält sich wie ein
//! typischer Realtime-Broadcast-Dienst: Nachrichten gehen standardmäßig auch
//! an den Absender zurück, Duplikate und Ausfälle lassen sich zuschalten.
//! Jede veröffentlichte Nachricht wird protokolliert.

use super::messages::{SignalKind, SignalMessage};
use super::transport::{SignalingError, SignalingTransport, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Eintrag im Publish-Protokoll
#[derive(Debug, Clone)]
pub struct PublishedSignal {
    pub topic: String,
    pub endpoint: String,
    pub message: SignalMessage,
    pub at: DateTime<Utc>,
}

struct Subscriber {
    id: Uuid,
    endpoint: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

struct HubInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    log: Mutex<Vec<PublishedSignal>>,
    reachable: AtomicBool,
    duplicate_delivery: AtomicBool,
    self_echo: AtomicBool,
}

/// Gemeinsamer Hub; `endpoint()` liefert den Transport eines Teilnehmers
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                duplicate_delivery: AtomicBool::new(false),
                self_echo: AtomicBool::new(true),
            }),
        }
    }

    /// Transport für einen Teilnehmer
    pub fn endpoint(&self, participant_id: impl Into<String>) -> Arc<HubEndpoint> {
        Arc::new(HubEndpoint {
            participant_id: participant_id.into(),
            hub: Arc::clone(&self.inner),
        })
    }

    /// Simuliert einen Ausfall: subscribe/publish schlagen fehl
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Jede Nachricht wird doppelt zugestellt
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Nachrichten gehen auch an den Absender zurück (Standard: an)
    pub fn set_self_echo(&self, enabled: bool) {
        self.inner.self_echo.store(enabled, Ordering::SeqCst);
    }

    /// Alle bisher veröffentlichten Nachrichten
    pub fn published(&self) -> Vec<PublishedSignal> {
        self.inner.log.lock().clone()
    }

    /// Anzahl veröffentlichter Nachrichten eines Typs von einem Teilnehmer
    pub fn published_count(&self, endpoint: &str, kind: SignalKind) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|p| p.endpoint == endpoint && p.message.kind() == kind)
            .count()
    }

    /// Anzahl aktiver Abonnenten eines Topics
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("topics", &self.inner.topics.lock().len())
            .field("published", &self.inner.log.lock().len())
            .finish()
    }
}

/// Transport eines Teilnehmers am `LocalHub`
pub struct HubEndpoint {
    participant_id: String,
    hub: Arc<HubInner>,
}

impl HubEndpoint {
    fn ensure_reachable(&self) -> Result<(), SignalingError> {
        if self.hub.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SignalingError::Unreachable("local hub offline".to_string()))
        }
    }
}

#[async_trait]
impl SignalingTransport for HubEndpoint {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        self.ensure_reachable()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.hub
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                endpoint: self.participant_id.clone(),
                tx,
            });

        tracing::debug!("{} subscribed to {} ({})", self.participant_id, topic, id);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            stream: stream.boxed(),
        })
    }

    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), SignalingError> {
        self.ensure_reachable()?;

        self.hub.log.lock().push(PublishedSignal {
            topic: topic.to_string(),
            endpoint: self.participant_id.clone(),
            message: message.clone(),
            at: Utc::now(),
        });

        let echo = self.hub.self_echo.load(Ordering::SeqCst);
        let copies = if self.hub.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        let mut topics = self.hub.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter() {
                if !echo && sub.endpoint == self.participant_id {
                    continue;
                }
                for _ in 0..copies {
                    let _ = sub.tx.send(message.clone());
                }
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), SignalingError> {
        let mut topics = self.hub.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        tracing::debug!("{} unsubscribed from {} ({})", self.participant_id, topic, id);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::SessionDescription;

    #[tokio::test]
    async fn test_broadcast_reaches_sender_and_peer() {
        let hub = LocalHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");

        let mut alice_rx = alice.subscribe("call:1").await.unwrap().stream;
        let mut bob_rx = bob.subscribe("call:1").await.unwrap().stream;

        alice
            .publish("call:1", SignalMessage::offer("alice", SessionDescription::offer("x"), false))
            .await
            .unwrap();

        assert_eq!(bob_rx.next().await.unwrap().from(), "alice");
        // Echo an den Absender
        assert_eq!(alice_rx.next().await.unwrap().from(), "alice");
    }

    #[tokio::test]
    async fn test_self_echo_can_be_disabled() {
        let hub = LocalHub::new();
        hub.set_self_echo(false);
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");

        let mut alice_rx = alice.subscribe("call:1").await.unwrap().stream;
        let mut bob_rx = bob.subscribe("call:1").await.unwrap().stream;

        alice.publish("call:1", SignalMessage::hangup("alice")).await.unwrap();
        bob.publish("call:1", SignalMessage::decline("bob")).await.unwrap();

        assert_eq!(bob_rx.next().await.unwrap().kind(), SignalKind::Hangup);
        // Alice sieht nur Bobs Nachricht
        assert_eq!(alice_rx.next().await.unwrap().kind(), SignalKind::Decline);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = LocalHub::new();
        let alice = hub.endpoint("alice");
        let bob = hub.endpoint("bob");

        let mut bob_rx = bob.subscribe("call:2").await.unwrap().stream;
        alice.publish("call:1", SignalMessage::hangup("alice")).await.unwrap();
        alice.publish("call:2", SignalMessage::decline("alice")).await.unwrap();

        assert_eq!(bob_rx.next().await.unwrap().kind(), SignalKind::Decline);
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let hub = LocalHub::new();
        hub.set_duplicate_delivery(true);
        let bob = hub.endpoint("bob");
        let mut rx = bob.subscribe("t").await.unwrap().stream;

        hub.endpoint("alice")
            .publish("t", SignalMessage::hangup("alice"))
            .await
            .unwrap();

        assert_eq!(rx.next().await.unwrap().kind(), SignalKind::Hangup);
        assert_eq!(rx.next().await.unwrap().kind(), SignalKind::Hangup);
        assert_eq!(hub.published_count("alice", SignalKind::Hangup), 1);
    }

    #[tokio::test]
    async fn test_unreachable_hub() {
        let hub = LocalHub::new();
        hub.set_reachable(false);
        let alice = hub.endpoint("alice");

        assert!(matches!(
            alice.subscribe("t").await,
            Err(SignalingError::Unreachable(_))
        ));
        assert!(alice.publish("t", SignalMessage::hangup("alice")).await.is_err());
        assert!(hub.published().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let hub = LocalHub::new();
        let bob = hub.endpoint("bob");
        let mut sub = bob.subscribe("t").await.unwrap();
        assert_eq!(hub.subscriber_count("t"), 1);

        bob.unsubscribe("t", sub.id).await.unwrap();

        assert!(sub.stream.next().await.is_none());
        assert_eq!(hub.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_other_subscription_of_same_endpoint() {
        let hub = LocalHub::new();
        let bob = hub.endpoint("bob");
        let mut old = bob.subscribe("t").await.unwrap();
        let mut new = bob.subscribe("t").await.unwrap();
        assert_ne!(old.id, new.id);

        bob.unsubscribe("t", old.id).await.unwrap();
        assert!(old.stream.next().await.is_none());
        assert_eq!(hub.subscriber_count("t"), 1);

        hub.endpoint("alice")
            .publish("t", SignalMessage::hangup("alice"))
            .await
            .unwrap();
        assert_eq!(new.stream.next().await.unwrap().from(), "alice");
    }
}
