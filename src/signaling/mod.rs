//! Signaling Module
//!
//! Austausch von Offer/Answer, ICE Candidates und Hangup/Decline über einen
//! topic-basierten Broadcast-Kanal:
//! - `SignalingTransport`: die Schnittstelle, die eine Session benutzt
//! - `RelayClient`: WebSocket-Verbindung zu einem Relay-Server
//! - `LocalHub`: In-Process Broadcast für lokale Sessions und Tests
//!

mod client;
mod local;
mod messages;
mod transport;

pub use client::RelayClient;
pub use local::{HubEndpoint, LocalHub, PublishedSignal};
pub use messages::*;
pub use transport::{SignalStream, SignalingError, SignalingTransport, Subscription};
