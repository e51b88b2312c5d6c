//! WebSocket Client für einen Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Topic-Abos mit Bestätigung durch den Relay
//! - Heartbeat-Keeping
//! - Verteilung eingehender Nachrichten auf die Streams der Abos

use super::messages::{ClientFrame, RelayFrame, SignalMessage};
use super::transport::{SignalingError, SignalingTransport, Subscription};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

/// Maximale Wartezeit auf `subscribed` vom Relay
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

type AckSender = oneshot::Sender<Result<(), SignalingError>>;

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

#[derive(Default)]
struct Routing {
    /// Offene Streams pro Topic
    subscriptions: HashMap<String, Vec<(Uuid, mpsc::UnboundedSender<SignalMessage>)>>,
    /// Wartende `subscribe()`-Aufrufe pro Topic
    pending_acks: HashMap<String, Vec<(Uuid, AckSender)>>,
}

impl Routing {
    /// Entfernt ein einzelnes Abo; `true` wenn das Topic danach keine
    /// lokalen Streams mehr hat
    fn remove(&mut self, topic: &str, id: Uuid) -> bool {
        if let Some(waiters) = self.pending_acks.get_mut(topic) {
            waiters.retain(|(waiter, _)| *waiter != id);
            if waiters.is_empty() {
                self.pending_acks.remove(topic);
            }
        }

        if let Some(senders) = self.subscriptions.get_mut(topic) {
            senders.retain(|(sender, tx)| *sender != id && !tx.is_closed());
            if senders.is_empty() {
                self.subscriptions.remove(topic);
            }
        }
        !self.subscriptions.contains_key(topic)
    }
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket-basierter `SignalingTransport`
pub struct RelayClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    routing: Arc<Mutex<Routing>>,
    tx: mpsc::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayClient {
    /// Verbindet mit dem Relay und startet Read-, Write- und Heartbeat-Task
    pub async fn connect(
        server_url: &str,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, SignalingError> {
        let ws_url = Self::websocket_url(server_url)?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));
        let routing = Arc::new(Mutex::new(Routing::default()));

        // Read-Task
        let state_clone = Arc::clone(&state);
        let routing_clone = Arc::clone(&routing);
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => Self::handle_relay_frame(frame, &routing_clone),
                        Err(e) => tracing::debug!("Ignoring malformed relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;

            // Alle Streams beenden, wartende Abos abbrechen
            let mut routing = routing_clone.lock();
            routing.subscriptions.clear();
            for (_, waiters) in routing.pending_acks.drain() {
                for (_, waiter) in waiters {
                    let _ = waiter.send(Err(SignalingError::NotConnected));
                }
            }
            tracing::info!("Disconnected from signaling relay");
        });

        // Write-Task
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let client = Arc::new(Self {
            server_url: ws_url.to_string(),
            state,
            routing,
            tx,
            tasks: Mutex::new(vec![read_task, write_task]),
        });

        let heartbeat_task = Self::start_heartbeat(Arc::clone(&client.state), client.tx.clone(), heartbeat);
        client.tasks.lock().push(heartbeat_task);

        Ok(client)
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// http(s) wird zu ws(s), andere Schemata werden abgelehnt
    fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            SignalingError::ConnectionFailed(format!("cannot use scheme '{}'", scheme))
        })?;

        Ok(url)
    }

    /// Serialisiert und sendet einen Frame
    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(frame)?;
        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Relay-Frames
    fn handle_relay_frame(frame: RelayFrame, routing: &Arc<Mutex<Routing>>) {
        match frame {
            RelayFrame::Subscribed { topic } => {
                tracing::debug!("Subscription confirmed: {}", topic);
                if let Some(waiters) = routing.lock().pending_acks.remove(&topic) {
                    for (_, waiter) in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }

            RelayFrame::Message { topic, message } => {
                let mut routing = routing.lock();
                if let Some(senders) = routing.subscriptions.get_mut(&topic) {
                    senders.retain(|(_, s)| s.send(message.clone()).is_ok());
                }
            }

            RelayFrame::Error {
                code,
                message,
                topic,
            } => {
                tracing::error!("Relay error {}: {}", code, message);
                // Fehler zu einem Abo an die Wartenden melden
                if let Some(topic) = topic {
                    if let Some(waiters) = routing.lock().pending_acks.remove(&topic) {
                        for (_, waiter) in waiters {
                            let _ = waiter.send(Err(SignalingError::ServerError {
                                code,
                                message: message.clone(),
                            }));
                        }
                    }
                }
            }

            RelayFrame::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    /// Startet den Heartbeat-Task
    fn start_heartbeat(
        state: Arc<RwLock<ClientState>>,
        tx: mpsc::Sender<String>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Ok(ping) = serde_json::to_string(&ClientFrame::Ping) else {
                return;
            };
            let mut ticker = tokio::time::interval(interval);
            // Der erste Tick kommt sofort
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !state.read().is_connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = tx.send(ping.clone()).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        })
    }
}

#[async_trait]
impl SignalingTransport for RelayClient {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        // Stream vor dem Frame registrieren, damit nichts verloren geht
        let id = Uuid::new_v4();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut routing = self.routing.lock();
            routing
                .subscriptions
                .entry(topic.to_string())
                .or_default()
                .push((id, msg_tx));
            routing
                .pending_acks
                .entry(topic.to_string())
                .or_default()
                .push((id, ack_tx));
        }

        let confirmed = match self
            .send_frame(&ClientFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await
        {
            Ok(()) => match tokio::time::timeout(SUBSCRIBE_TIMEOUT, ack_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(SignalingError::NotConnected),
                Err(_) => Err(SignalingError::SubscribeTimeout(topic.to_string())),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = confirmed {
            // Nur das eigene Abo zurücknehmen
            self.routing.lock().remove(topic, id);
            return Err(e);
        }
        tracing::debug!("Subscribed to {} ({})", topic, id);

        let stream = futures::stream::unfold(msg_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Subscription {
            id,
            topic: topic.to_string(),
            stream: stream.boxed(),
        })
    }

    async fn publish(&self, topic: &str, message: SignalMessage) -> Result<(), SignalingError> {
        tracing::debug!("Publishing {} to {}", message.kind(), topic);
        self.send_frame(&ClientFrame::Publish {
            topic: topic.to_string(),
            message,
            timestamp: Utc::now().timestamp_millis(),
        })
        .await
    }

    async fn unsubscribe(&self, topic: &str, id: Uuid) -> Result<(), SignalingError> {
        let last = self.routing.lock().remove(topic, id);

        // Der Relay erfährt erst davon, wenn kein lokaler Stream mehr zuhört
        if !last || !self.is_connected() {
            return Ok(());
        }
        self.send_frame(&ClientFrame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_from_http() {
        let url = RelayClient::websocket_url("https://relay.example.com/ws").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");

        let url = RelayClient::websocket_url("http://127.0.0.1:9000").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(matches!(
            RelayClient::websocket_url("ftp://relay.example.com"),
            Err(SignalingError::ConnectionFailed(_))
        ));
        assert!(RelayClient::websocket_url("not a url").is_err());
    }

    #[test]
    fn test_routing_remove_only_drops_own_subscription() {
        let mut routing = Routing::default();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();
        routing
            .subscriptions
            .insert("t".to_string(), vec![(first, first_tx), (second, second_tx)]);

        assert!(!routing.remove("t", first));
        assert!(first_rx.try_recv().is_err());
        assert_eq!(routing.subscriptions["t"].len(), 1);
        assert_eq!(routing.subscriptions["t"][0].0, second);

        assert!(routing.remove("t", second));
        assert!(routing.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 9 (discard) ist auf Test-Maschinen praktisch nie offen
        let result = RelayClient::connect("ws://127.0.0.1:9", Duration::from_secs(25)).await;
        assert!(matches!(result, Err(SignalingError::ConnectionFailed(_))));
    }
}
