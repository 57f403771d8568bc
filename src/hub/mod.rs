//! Hub Module - Presence Hub (Server-Seite)
//!
//! - Presence Set: Identität → aktuelle Verbindung (last connection wins)
//! - Membership-Snapshots an alle Verbundenen
//! - Reines Relay der Signaling-Nachrichten nach Ziel-Identität
//! - WebSocket-Transport über axum

mod presence;
mod server;

pub use presence::{ConnectionHandle, ConnectionId, PresenceGuard, PresenceHub, RouteOutcome};
pub use server::{router, serve, HubError, HubState};
