//! callwire - Signaling-Kern für P2P Voice Calls
//!
//! Zwei Hälften, ein Nachrichtenvertrag:
//! - Presence Hub: nimmt authentifizierte Verbindungen an, verteilt die
//!   Online-Liste und leitet Call-Signale an die Ziel-Identität weiter
//! - Call Session Machine: führt einen Anruf pro Teilnehmer durch
//!   Offer/Answer, Trickle ICE, Verbindung und Abbau
//!
//! Audio selbst fließt P2P und nie über den Hub.

pub mod app;
pub mod auth;
pub mod call_engine;
pub mod config;
pub mod hub;
pub mod signaling;

pub use app::{CallClient, ClientError, ClientOptions};
pub use call_engine::{CallEngine, CallError, CallEvent, CallState};
pub use hub::{PresenceHub, RouteOutcome};
pub use signaling::{ClientMessage, ServerMessage, UserId};
