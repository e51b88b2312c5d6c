//! Call Negotiator - Aushandlung von 1:1 Audio/Video-Anrufen
//!
//! Baut eine Echtzeit-Verbindung zwischen zwei Teilnehmern über einen
//! unzuverlässigen Broadcast-Signaling-Kanal auf, hält sie und baut sie
//! wieder ab:
//! - Call Sessions als Zustandsautomat mit eigener Mailbox
//! - WebSocket-Relay oder In-Process Hub als Signaling
//! - WebRTC (webrtc-rs) als Peer Connection
//! - Mikrofon über cpal (Feature `device-audio`)

pub mod call_engine;
pub mod config;
pub mod signaling;

pub use call_engine::{
    CallEngine, CallError, CallEvent, CallRole, CallSession, CallState, CallSummary, CallTarget,
    Collaborators,
};
pub use config::EngineConfig;

/// Initialisiert Logging über `RUST_LOG`, mit sinnvollen Standardwerten
///
/// Mehrfache Aufrufe sind harmlos; ein bereits gesetzter Subscriber bleibt.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["call_negotiator=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized");
    }
}
