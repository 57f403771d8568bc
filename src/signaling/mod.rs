//! Signaling Module - Nachrichtenvertrag und Hub-Client
//!
//! Dieses Modul enthält:
//! - Den gemeinsamen Nachrichtenvertrag zwischen Hub und Clients
//! - Den WebSocket-Client, über den eine Call Engine signalisiert
//!

mod client;
mod messages;

pub use client::{ws_endpoint, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;

/// Ausgehender Signaling-Kanal der Call Engine.
///
/// Versand ist best-effort und darf nicht blockieren; ob die Nachricht beim
/// Ziel ankommt, erfährt der Absender nicht.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;
}
