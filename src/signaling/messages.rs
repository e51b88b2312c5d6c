//! Message Types für das Call-Signaling
//!
//! `SignalMessage` ist das, was zwei Teilnehmer über das Topic eines Anrufs
//! austauschen. `ClientFrame`/`RelayFrame` sind die Umschläge, mit denen der
//! `RelayClient` diese Nachrichten über den WebSocket-Relay transportiert.
//!
//! Das JSON-Format entspricht dem, was Browser-Clients senden
//! (`sdpMid`, `sdpMLineIndex`, `{"type":"offer","sdp":..}`).

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SESSION DESCRIPTION & CANDIDATES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate (Trickle-ICE)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNAL MESSAGES
// ============================================================================

/// Typ einer Signal-Nachricht ohne Nutzdaten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Hangup,
    Decline,
    RequestOffer,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Hangup => "hangup",
            SignalKind::Decline => "decline",
            SignalKind::RequestOffer => "request_offer",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nachricht auf dem Topic eines Anrufs
///
/// `from` ist immer die Participant-ID des Absenders; Empfänger verwerfen
/// damit ihre eigenen Broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// SDP Offer vom Anrufer
    Offer {
        from: String,
        payload: SessionDescription,
        #[serde(default)]
        video: bool,
    },

    /// SDP Answer vom Angerufenen
    Answer {
        from: String,
        payload: SessionDescription,
    },

    /// ICE Candidate
    Candidate { from: String, payload: IceCandidate },

    /// Anruf beendet
    Hangup { from: String },

    /// Anruf abgelehnt
    Decline { from: String },

    /// Angerufener ist bereit, hat aber noch kein Offer gesehen
    RequestOffer { from: String },
}

impl SignalMessage {
    pub fn offer(from: impl Into<String>, payload: SessionDescription, video: bool) -> Self {
        Self::Offer {
            from: from.into(),
            payload,
            video,
        }
    }

    pub fn answer(from: impl Into<String>, payload: SessionDescription) -> Self {
        Self::Answer {
            from: from.into(),
            payload,
        }
    }

    pub fn candidate(from: impl Into<String>, payload: IceCandidate) -> Self {
        Self::Candidate {
            from: from.into(),
            payload,
        }
    }

    pub fn hangup(from: impl Into<String>) -> Self {
        Self::Hangup { from: from.into() }
    }

    pub fn decline(from: impl Into<String>) -> Self {
        Self::Decline { from: from.into() }
    }

    pub fn request_offer(from: impl Into<String>) -> Self {
        Self::RequestOffer { from: from.into() }
    }

    /// Participant-ID des Absenders
    pub fn from(&self) -> &str {
        match self {
            SignalMessage::Offer { from, .. }
            | SignalMessage::Answer { from, .. }
            | SignalMessage::Candidate { from, .. }
            | SignalMessage::Hangup { from }
            | SignalMessage::Decline { from }
            | SignalMessage::RequestOffer { from } => from,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::Offer { .. } => SignalKind::Offer,
            SignalMessage::Answer { .. } => SignalKind::Answer,
            SignalMessage::Candidate { .. } => SignalKind::Candidate,
            SignalMessage::Hangup { .. } => SignalKind::Hangup,
            SignalMessage::Decline { .. } => SignalKind::Decline,
            SignalMessage::RequestOffer { .. } => SignalKind::RequestOffer,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ============================================================================
// RELAY FRAMES
// ============================================================================

/// Client → Relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        message: SignalMessage,
        timestamp: i64,
    },
    Ping,
}

/// Relay → Client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Subscription ist aktiv
    Subscribed { topic: String },

    /// Nachricht auf einem abonnierten Topic
    Message {
        topic: String,
        message: SignalMessage,
    },

    /// Fehler vom Relay
    Error {
        code: i32,
        message: String,
        #[serde(default)]
        topic: Option<String>,
    },

    /// Heartbeat Antwort
    Pong,
}

// ============================================================================
// TESTS
// ============================================================================
